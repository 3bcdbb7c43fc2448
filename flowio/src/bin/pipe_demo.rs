//! Pipe CLI Demo
//!
//! Reads lines from stdin, upper-cases them in a transform and prints them.
//! Set `RUST_LOG=flowio=debug` to watch the streams.

use std::io::{self, Write};

use flowio::{
    BlockingSource, FnTarget, Readable, ReadableOptions, Runtime, StreamError, Transform,
    Writable, WritableOptions,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let rt = Runtime::new();

    let stdin = io::stdin();
    let lines = BlockingSource::new(&rt, move |_requested: usize| {
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(vec![line.trim_end_matches(['\r', '\n']).to_string()])),
            Err(e) => Err(StreamError::from_source(e)),
        }
    });
    let input = Readable::with_source(&rt, ReadableOptions::default(), lines);

    let upper = Transform::map(&rt, |line: String| line.to_uppercase());

    let stdout = Writable::new(
        &rt,
        WritableOptions::default(),
        FnTarget::new(|lines: Vec<String>| {
            let mut out = io::stdout().lock();
            for line in lines {
                writeln!(out, "{line}").map_err(StreamError::from_target)?;
            }
            out.flush().map_err(StreamError::from_target)
        }),
    );
    stdout.on_error(|e| log::error!("stdout: {e}"));
    stdout.on_finish(|()| log::info!("done"));

    input.pipe(upper).pipe(stdout);

    rt.run().await?;
    rt.teardown()?;
    Ok(())
}

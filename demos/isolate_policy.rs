//! Keep feeding healthy consumers when one gives up.
//!
//! The "sniffer" only needs the first bytes of the stream. Under the default
//! policy its early exit would break the whole tee; with
//! `FailurePolicy::Isolate` its branch is detached and the other consumer
//! still receives everything.
//!
//! Run with: `cargo run --example isolate_policy`

use std::io::{self, Cursor, Read};

use riverfork::{Consumer, FailurePolicy, Orchestrator, Result, TeeConfig};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("riverfork=debug,info")
        .init();

    let mut payload = b"RIFF".to_vec();
    payload.extend(std::iter::repeat_n(0xabu8, 256 * 1024));

    let orchestrator = Orchestrator::with_config(
        TeeConfig::low_memory().with_failure_policy(FailurePolicy::Isolate),
    );

    let (results, report) = orchestrator.run_with_report(
        Cursor::new(payload),
        vec![
            Consumer::with_capacity(64, |reader| {
                let mut magic = [0u8; 4];
                reader.read_exact(&mut magic)?;
                Ok(String::from_utf8_lossy(&magic).into_owned())
            }),
            Consumer::new(|reader| {
                let n = io::copy(reader, &mut io::sink())?;
                Ok(format!("{} bytes", n))
            }),
        ],
    )?;

    println!("Sniffed format: {}", results[0]);
    println!("Counted: {}", results[1]);
    println!(
        "Read {} bytes in {} chunks ({:?}), detached branches: {:?}",
        report.total_bytes, report.chunks, report.elapsed, report.detached
    );

    Ok(())
}

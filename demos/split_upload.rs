//! Split one upload into an archive copy and a checksum.
//!
//! A single pass over the input feeds two consumers: one stores the bytes,
//! the other hashes them with a small branch so it never buffers much.
//!
//! Run with: `cargo run --example split_upload -- <file>`

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read};
use std::time::Duration;

use riverfork::observability::{FanoutSink, MetricsSink, TracingSink, init_metrics};
use riverfork::{Consumer, Orchestrator, Result, TeeConfig};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("riverfork=debug,info")
        .init();
    init_metrics();

    let source: Box<dyn Read> = match std::env::args().nth(1) {
        Some(path) => Box::new(File::open(&path).map_err(riverfork::Error::SourceRead)?),
        None => {
            println!("No file given, uploading a generated payload\n");
            Box::new(io::repeat(b'z').take(1024 * 1024))
        }
    };

    let orchestrator = Orchestrator::with_config(
        TeeConfig::upload().with_deadline(Duration::from_secs(30)),
    )
    .with_sink(
        FanoutSink::new()
            .with(TracingSink::default())
            .with(MetricsSink::new("split_upload")),
    );

    let (stored, digest) = orchestrator.run_pair(
        source,
        Consumer::new(|reader| {
            let mut archive = Vec::new();
            reader.read_to_end(&mut archive)?;
            Ok(archive)
        }),
        Consumer::with_capacity(256, |reader| {
            let mut hasher = DefaultHasher::new();
            let mut buf = [0u8; 128];
            loop {
                let n = reader.read_chunk(&mut buf)?;
                if n == 0 {
                    return Ok(hasher.finish());
                }
                hasher.write(&buf[..n]);
            }
        }),
    )?;

    println!("Stored {} bytes", stored.len());
    println!("Digest {:016x}", digest);

    Ok(())
}

//! Demo worker: a small tokenizer/parser target with recorded probes.
//!
//! Launched by the supervisor as `forkline_core <port> <target> [args...]`.

use anyhow::Context;
use forkline_core::worker::{self, Harness, HarnessRegistry, ProbeMap, UnitProbes};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const TOKENIZER_UNIT: &[u8] = include_bytes!("../demo_units/tokenizer.unit.toml");
const PARSER_UNIT: &[u8] = include_bytes!("../demo_units/parser.unit.toml");

#[derive(Error, Debug)]
#[error("unexpected token at offset {offset}")]
struct SyntaxError {
    offset: usize,
}

fn tokenize(probes: &UnitProbes, data: &[u8]) {
    probes.hit(0);
    for byte in data {
        match byte {
            b'0'..=b'9' => probes.hit(1),
            b if b.is_ascii_alphabetic() => probes.hit(2),
            _ => probes.hit(3),
        }
    }
}

fn parse(probes: &UnitProbes, data: &[u8]) -> anyhow::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    probes.hit(0);
    if data.starts_with(b"PANIC") {
        probes.hit(1);
        panic!("parser panicked on {} bytes", data.len());
    }
    if data.starts_with(b"ERR") {
        probes.hit(2);
        return Err(SyntaxError { offset: 3 }).context("failed to parse demo input");
    }
    if data.starts_with(b"HANG") {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
    if data.starts_with(b"ABORT") {
        std::process::abort();
    }
    probes.hit(3);
    Ok(())
}

fn demo_harness(probes: &ProbeMap, _args: &[String]) -> anyhow::Result<Box<dyn Harness>> {
    let tokenizer = probes.register(TOKENIZER_UNIT)?;
    let parser = probes.register(PARSER_UNIT)?;
    Ok(Box::new(move |data: &[u8]| {
        tokenize(&tokenizer, data);
        parse(&parser, data)
    }))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = HarnessRegistry::new().register("demo", demo_harness);
    let executed = worker::run_from_args(&registry, std::env::args().skip(1))?;
    tracing::debug!("Worker exiting after {} inputs", executed);
    Ok(())
}

#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations, missing_docs, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use clap::Parser;
use std::process::ExitCode;

mod cli;
mod config;
mod container;
mod datadir;
mod fsutil;
mod registry;
mod resources;
mod results;
mod rollback;
mod rpc;
mod runner;
mod source;
mod suite;
mod upload;
mod util;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    cli::Cli::parse().run().await
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rros-topic-echo - Echo ROS1 topic messages in real-time
//!
//! Like `rostopic echo`, but payloads are printed raw (hex or utf-8
//! lossy): this tool subscribes with the wildcard digest and does not
//! deserialize.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use rros::{wait_port_open, Node, StaticSchemaDb};

/// Echo ROS1 topic messages (like rostopic echo)
#[derive(Parser, Debug)]
#[command(name = "rros-topic-echo")]
#[command(version)]
#[command(about = "Echo ROS1 topic messages (like rostopic echo)")]
struct Args {
    /// Topic name to subscribe to
    topic: String,

    /// Message type, e.g. std_msgs/String
    #[arg(short = 't', long, default_value = "std_msgs/String")]
    msg_type: String,

    /// ROS master host
    #[arg(long, default_value = "127.0.0.1")]
    master_host: String,

    /// ROS master port
    #[arg(long, default_value = "11311")]
    master_port: u16,

    /// Node name to register under
    #[arg(long, default_value = "/rros_topic_echo")]
    name: String,

    /// Maximum number of messages to receive (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Print payloads as lossy utf-8 instead of hex
    #[arg(long)]
    text: bool,

    /// Wait this many milliseconds for the master to come up
    #[arg(long, default_value = "5000")]
    wait_master_ms: u64,
}

fn hex_dump(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = wait_port_open(&args.master_host, args.master_port, Some(args.wait_master_ms)) {
        eprintln!(
            "master {}:{} unreachable: {}",
            args.master_host, args.master_port, e
        );
        return ExitCode::FAILURE;
    }

    // Wildcard digests: echo accepts whatever the publisher sends.
    let db = StaticSchemaDb::new().with_wildcard_fallback();
    let mut node = match Node::new(
        &args.name,
        "",
        &args.master_host,
        args.master_port,
        Box::new(db),
    ) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("node creation failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let exit = Arc::new(AtomicBool::new(false));
    {
        // Signal handling belongs to the harness; the runtime only ever
        // polls the flag.
        let exit = exit.clone();
        if let Err(e) = ctrlc::set_handler(move || exit.store(true, Ordering::Relaxed)) {
            eprintln!("failed to install signal handler: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let seen = Arc::new(AtomicU64::new(0));
    let topic = args.topic.clone();
    let result = {
        let exit = exit.clone();
        let seen = seen.clone();
        let max = args.count;
        let text = args.text;
        node.register_subscriber(&args.topic, &args.msg_type, true, move |payload| {
            let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
            if text {
                println!("[{} #{}] {}", topic, n, String::from_utf8_lossy(payload));
            } else {
                println!("[{} #{}] ({} bytes) {}", topic, n, payload.len(), hex_dump(payload));
            }
            if max > 0 && n >= max {
                exit.store(true, Ordering::Relaxed);
            }
        })
    };
    if let Err(e) = result {
        eprintln!("subscription failed: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!("echoing {} ({}), ctrl-c to stop", args.topic, args.msg_type);
    match node.run(None, &exit) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("node loop failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

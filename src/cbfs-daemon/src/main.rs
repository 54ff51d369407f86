mod fetch;
mod http;
mod ingest;
mod node;
mod peers;

use crate::node::{NodeOptions, NodeState};
use cbfs_lib::{CbfsError, CbfsResult};
use log::{error, info};
use rand::RngCore;
use std::env;
use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8484";

struct DaemonOptions {
    root: PathBuf,
    bind: String,
    node_name: String,
    advertise: Option<String>,
}

fn usage() -> String {
    format!(
        "usage: cbfs-daemon <blob-root> [--bind <addr:port>] [--name <node-name>] [--advertise <addr:port>]\n\
         defaults:\n\
         --bind {}\n\
         --name cbfs-<random>",
        DEFAULT_BIND_ADDR
    )
}

fn parse_args() -> Result<DaemonOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let root = PathBuf::from(args[0].clone());
    let mut bind = DEFAULT_BIND_ADDR.to_string();
    let mut node_name = {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        format!("cbfs-{}", hex::encode(suffix))
    };
    let mut advertise = None;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --bind".to_string())?;
                bind = value.clone();
            }
            "--name" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --name".to_string())?;
                node_name = value.clone();
            }
            "--advertise" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --advertise".to_string())?;
                advertise = Some(value.clone());
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }
    Ok(DaemonOptions {
        root,
        bind,
        node_name,
        advertise,
    })
}

async fn run(options: DaemonOptions) -> CbfsResult<()> {
    let listener = tokio::net::TcpListener::bind(&options.bind)
        .await
        .map_err(|e| CbfsError::IoError(format!("bind {} failed: {}", options.bind, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| CbfsError::IoError(e.to_string()))?;
    let advertise = options
        .advertise
        .unwrap_or_else(|| local_addr.to_string());

    // The shared metadata service is reached through the MetaStore
    // contract; the bundled in-process store covers single-node use.
    let meta = cluster_meta::MemMetaStore::new();
    let state = NodeState::bootstrap(
        NodeOptions {
            node_name: options.node_name,
            root: options.root,
            advertise_addr: advertise,
            bind_port: local_addr.port(),
        },
        meta,
    )
    .await?;

    info!("listening on {}", local_addr);
    axum::serve(listener, http::build_router(state))
        .await
        .map_err(|e| CbfsError::IoError(e.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(options).await {
        error!("cbfs-daemon failed: {}", err);
        std::process::exit(1);
    }
}

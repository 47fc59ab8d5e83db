//! # mcache Command Line
//!
//! Purpose: Issue single cache commands against a server pool from a shell,
//! for smoke tests and debugging.
//!
//! ## Usage
//!
//! Built only with the `cli` feature (`--features cli`).
//!
//! ```text
//! mcache-cli [--servers LIST] [--config FILE] [--timeout MS] COMMAND [ARGS...]
//!
//!   get KEY                  print value, flags, and CAS
//!   set|add|replace KEY VAL  [--exp SECS] [--flags N] [--cas N]
//!   delete KEY
//!   incr|decr KEY [DELTA] [INITIAL]
//!   noop [INDEX]
//!   version [INDEX]
//!   stat [GROUP] [INDEX]     print statistics as JSON
//! ```
//!
//! `RUST_LOG` controls client logging (default `warn`).

use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use mcache_client::{Client, ClientConfig, Counter, GetFields, StoreParams};

struct CliArgs {
    config: ClientConfig,
    timeout: Option<Duration>,
    command: String,
    params: Vec<String>,
    store: StoreParams,
}

impl CliArgs {
    fn parse() -> Result<Self> {
        let mut config = ClientConfig::default();
        let mut servers = None;
        let mut timeout = None;
        let mut store = StoreParams::default();
        let mut positional = Vec::new();

        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .ok_or_else(|| anyhow!("{} requires a value", name))
            };
            match arg.as_str() {
                "--servers" => servers = Some(value("--servers")?),
                "--config" => {
                    let path = value("--config")?;
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("reading config file {}", path))?;
                    config = ClientConfig::from_json_str(&raw)?;
                }
                "--timeout" => {
                    let ms: u64 = value("--timeout")?.parse().context("--timeout")?;
                    timeout = Some(Duration::from_millis(ms));
                }
                "--exp" => store.expiration = value("--exp")?.parse().context("--exp")?,
                "--flags" => store.flags = value("--flags")?.parse().context("--flags")?,
                "--cas" => store.cas = value("--cas")?.parse().context("--cas")?,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => positional.push(arg),
            }
        }
        if let Some(list) = servers {
            config.servers = ClientConfig::with_servers(&list)?.servers;
        }

        let mut positional = positional.into_iter();
        let command = positional
            .next()
            .ok_or_else(|| anyhow!("missing command (try --help)"))?;
        Ok(CliArgs {
            config,
            timeout,
            command,
            params: positional.collect(),
            store,
        })
    }

    fn param(&self, index: usize, name: &str) -> Result<&str> {
        self.params
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("{} requires {}", self.command, name))
    }

    fn optional<T: std::str::FromStr>(&self, index: usize, fallback: T) -> Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.params.get(index) {
            Some(raw) => Ok(raw.parse()?),
            None => Ok(fallback),
        }
    }
}

fn print_usage() {
    println!(
        "usage: mcache-cli [--servers LIST] [--config FILE] [--timeout MS] \
         <get|set|add|replace|delete|incr|decr|noop|version|stat> [ARGS...]"
    );
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = CliArgs::parse()?;
    let mut client = Client::with_config(args.config.clone())?;
    run(&mut client, &args)
}

fn run(client: &mut Client, args: &CliArgs) -> Result<()> {
    let timeout = args.timeout;
    match args.command.as_str() {
        "get" => {
            let key = args.param(0, "KEY")?;
            let item = client
                .get(key.as_bytes(), GetFields::ALL, timeout)?
                .ready()
                .ok_or_else(|| anyhow!("command was buffered"))?;
            println!("{}", String::from_utf8_lossy(&item.value));
            println!("flags={} cas={}", item.flags.unwrap_or(0), item.cas.unwrap_or(0));
        }
        "set" | "add" | "replace" => {
            let key = args.param(0, "KEY")?.as_bytes();
            let value = args.param(1, "VALUE")?.as_bytes();
            let reply = match args.command.as_str() {
                "set" => client.set(key, value, args.store, timeout)?,
                "add" => client.add(key, value, args.store, timeout)?,
                _ => client.replace(key, value, args.store, timeout)?,
            };
            if let Some(cas) = reply.ready() {
                println!("STORED cas={}", cas);
            }
        }
        "delete" => {
            let key = args.param(0, "KEY")?;
            let _ = client.delete(key.as_bytes(), timeout)?;
            println!("DELETED");
        }
        "incr" | "decr" => {
            let key = args.param(0, "KEY")?.as_bytes();
            let counter = Counter {
                delta: args.optional(1, 1)?,
                initial: args.optional(2, 0)?,
                expiration: args.store.expiration,
            };
            let reply = if args.command == "incr" {
                client.increment(key, counter, timeout)?
            } else {
                client.decrement(key, counter, timeout)?
            };
            if let Some(value) = reply.ready() {
                println!("{}", value);
            }
        }
        "noop" => {
            let _ = client.noop(args.optional(0, 0)?, timeout)?;
            println!("OK");
        }
        "version" => {
            if let Some(version) = client.version(args.optional(0, 0)?, timeout)?.ready() {
                println!("{}", version);
            }
        }
        "stat" => {
            let group = args.params.first().map(String::as_str).unwrap_or("");
            let stats = client
                .stat(group, args.optional(1, 0)?, timeout)?
                .ready()
                .ok_or_else(|| anyhow!("command was buffered"))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        other => bail!("unknown command {:?} (try --help)", other),
    }
    Ok(())
}

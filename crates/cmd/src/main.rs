// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever};
use spool_app::{Broker, BrokerConfig};
use spool_common_telemetry as telemetry;
use spool_queue::{HEADER_LEN, JournalReader, ReadOutcome, inspect};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "spool",
about= "Durable journaled message queues",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION,
long_version = build_info::LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Server(ServerArgs),
    Dump(DumpArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the spool broker. SIGHUP reloads the config file.
Examples:

spool server --config spool.toml

")]
struct ServerArgs {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ServerArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let config = match &self.config {
            Some(path) => BrokerConfig::load(path)
                .with_whatever_context(|_| format!("Failed to load {}", path.display()))?,
            None => BrokerConfig::default(),
        };

        let _guards = telemetry::init_global_logging("spool", &config.logging)
            .whatever_context("Failed to initialize logging")?;
        telemetry::set_panic_hook();
        tracing::info!(version = build_info::FULL_VERSION, "Starting spool");

        let broker = Broker::open(config)
            .await
            .whatever_context("Failed to open queues")?;
        broker
            .run(self.config.clone())
            .await
            .whatever_context("Broker failed")
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Prints a replay summary of a queue journal without modifying it.
Examples:

spool dump data/queues/jobs
spool dump --records data/queues/jobs

")]
struct DumpArgs {
    /// Journal file to read.
    journal: PathBuf,

    /// Print every record with its offset.
    #[arg(long)]
    records: bool,
}

impl DumpArgs {
    fn run(&self) -> Result<(), Whatever> {
        if self.records {
            self.print_records()?;
        }
        let summary = inspect(&self.journal)
            .with_whatever_context(|_| format!("Failed to replay {}", self.journal.display()))?;
        println!("records:           {}", summary.records);
        println!("items:             {}", summary.items);
        println!("bytes:             {}", summary.bytes);
        println!("open reservations: {}", summary.open_reservations);
        println!("next id:           {}", summary.next_id);
        println!("next xid:          {}", summary.next_xid);
        if let Some(offset) = summary.torn_at {
            println!("torn at:           {offset}");
        }
        Ok(())
    }

    fn print_records(&self) -> Result<(), Whatever> {
        let mut reader = JournalReader::open(&self.journal, HEADER_LEN)
            .with_whatever_context(|_| format!("Failed to open {}", self.journal.display()))?;
        loop {
            let offset = reader.position();
            match reader.next_record().whatever_context("Failed to read record")? {
                ReadOutcome::Record(record, _) => println!("{offset:>10}  {record}"),
                ReadOutcome::End => break,
                ReadOutcome::Torn { offset, reason } => {
                    println!("{offset:>10}  TORN ({reason})");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Server(sa) => sa.run().await,
        Commands::Dump(da) => da.run(),
    }
}

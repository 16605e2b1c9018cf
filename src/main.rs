use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod utils;

use cmd::{AmqpArgs, HttpArgs};

/// tsu - terminal service utility
///
/// One invocation performs exactly one request/response cycle and exits:
///   tsu http [flags] <url>          send an HTTP request, pretty-print the response
///   tsu amqp -e NAME -k KEY [msg]   publish to a topic exchange, await one reply
///   tsu help [<task>]               general or per-task help
///
/// Exit codes:
///   0  request completed (any HTTP status) / reply printed
///   1  missing required option, unreadable payload file, or transport error
///
/// Examples:
///   tsu http -v http://localhost:8080/data.json
///   tsu http -m POST -d '{"a":1}' -H 'Content-Type:application/json' http://localhost:8080/items
///   tsu amqp -e orders -k order.created '{"id":1}'
#[derive(Parser, Debug)]
#[command(
    name = "tsu",
    version,
    about = "tsu - one-shot HTTP requests and AMQP request/reply from the terminal",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Static task registry: one variant per task, resolved by clap. Unrecognized
/// task names surface as a clap error with a non-zero exit.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a single HTTP request and pretty-print the response
    Http(HttpArgs),

    /// Publish one message to a topic exchange and await a single reply
    Amqp(AmqpArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Http(args) => cmd::execute_http(args),
        Commands::Amqp(args) => cmd::execute_amqp(args),
    }
}

mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::{Cli, CliCommand};
use crate::commands::{
    execute_capacity, execute_list, execute_reconcile, execute_stage, execute_status,
    execute_sweep, execute_watch, execute_write_status, open_manager,
};

async fn run_cli(cli: Cli) -> Result<Value> {
    if let CliCommand::WriteStatus(args) = &cli.command {
        return execute_write_status(args);
    }

    let manager = open_manager(&cli.manager)?;
    let output = match &cli.command {
        CliCommand::Stage(args) => execute_stage(&manager, args),
        CliCommand::Status(args) => execute_status(&manager, args),
        CliCommand::List(args) => execute_list(&manager, args),
        CliCommand::Capacity => execute_capacity(&manager),
        CliCommand::Reconcile => execute_reconcile(&manager),
        CliCommand::Sweep => execute_sweep(&manager),
        CliCommand::Watch => execute_watch(&manager).await,
        CliCommand::WriteStatus(args) => execute_write_status(args),
    };
    manager.shutdown()?;
    output
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let output = run_cli(cli).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

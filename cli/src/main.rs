use clap::Parser;
use pgstage::{level_from_verbosity, setup_logger, OperationKind, PostgresClient};

use crate::{
    cli_interface::{Commands, CLI},
    commands::{
        copy::handle_copy_command,
        extension::handle_install_extension_command,
        stage::{handle_run_command, handle_stage_command},
    },
    console::print_error_message,
};

mod cli_interface;
mod commands;
mod console;

async fn connect(cli: &CLI) -> Result<PostgresClient, Box<dyn std::error::Error>> {
    let client = match &cli.database_url {
        Some(url) => PostgresClient::connect(url).await,
        None => PostgresClient::new().await,
    };

    Ok(client.map_err(|e| format!("Could not connect to the database: trace: {}", e))?)
}

async fn run(cli: CLI) -> Result<(), Box<dyn std::error::Error>> {
    let client = connect(&cli).await?;

    match cli.command {
        Commands::Upsert { target, copy, clause } => {
            handle_stage_command(
                &client,
                &target,
                OperationKind::Upsert { clause },
                copy.to_copy_options(),
            )
            .await
        }
        Commands::Delete { target, copy } => {
            handle_stage_command(&client, &target, OperationKind::Delete, copy.to_copy_options())
                .await
        }
        Commands::Copy { target, copy } => {
            handle_copy_command(&client, &target, copy.to_copy_options()).await
        }
        Commands::Run { manifest, file } => handle_run_command(&client, &manifest, &file).await,
        Commands::InstallExtension { name } => {
            handle_install_extension_command(&client, &name).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = CLI::parse();
    setup_logger(level_from_verbosity(cli.verbose, cli.quiet));

    if let Err(e) = run(cli).await {
        print_error_message(&e.to_string());
        std::process::exit(1);
    }
}

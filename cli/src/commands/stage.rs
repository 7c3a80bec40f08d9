use std::path::Path;

use pgstage::{
    order_table_columns, reflect_table, CopyOptions, Manifest, OperationKind, PostgresClient,
    StagedMutation, Table,
};
use tokio::{fs::File, io::BufReader};

use crate::{
    cli_interface::TargetArgs,
    console::print_success_message,
};

pub async fn resolve_table(
    client: &PostgresClient,
    target: &TargetArgs,
) -> Result<Table, Box<dyn std::error::Error>> {
    let table = reflect_table(client, &target.table, &target.schema).await.map_err(|e| {
        format!(
            "Could not read the definition of {}.{}: trace: {}",
            target.schema, target.table, e
        )
    })?;

    match &target.columns {
        Some(columns) => Ok(order_table_columns(&table, columns)?),
        None => Ok(table),
    }
}

async fn run_staged(
    client: &PostgresClient,
    mutation: StagedMutation,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(file)
        .await
        .map_err(|e| format!("Could not open {}: trace: {}", file.display(), e))?;
    let mut reader = BufReader::new(file);

    let mut session = client.session().await?;
    let result = mutation.run(&mut session, &mut reader).await?;

    print_success_message(&format!(
        "{} rows staged through {}, {} rows affected in {}",
        result.staged_rows,
        result.staging_table,
        result.affected_rows,
        mutation.target().qualified_name()
    ));

    Ok(())
}

pub async fn handle_stage_command(
    client: &PostgresClient,
    target: &TargetArgs,
    kind: OperationKind,
    options: CopyOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = resolve_table(client, target).await?;
    let mutation = StagedMutation::new(table, kind, options)?;

    run_staged(client, mutation, &target.file).await
}

pub async fn handle_run_command(
    client: &PostgresClient,
    manifest_path: &Path,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::load(manifest_path).map_err(|e| {
        format!("Could not read the manifest {}: trace: {}", manifest_path.display(), e)
    })?;

    let table = reflect_table(client, &manifest.table, &manifest.schema).await?;
    let table = manifest.shape_table(table)?;
    let mutation = StagedMutation::new(table, manifest.operation_kind(), manifest.copy.clone())?;

    run_staged(client, mutation, file).await
}

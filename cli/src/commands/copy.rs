use pgstage::{CopyFrom, CopyOptions, PostgresClient, StagingSession};
use tokio::{fs::File, io::BufReader};

use crate::{
    cli_interface::TargetArgs,
    commands::stage::resolve_table,
    console::print_success_message,
};

pub async fn handle_copy_command(
    client: &PostgresClient,
    target: &TargetArgs,
    options: CopyOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = resolve_table(client, target).await?;
    let copy = CopyFrom::new(table, options)?;

    let file = File::open(&target.file)
        .await
        .map_err(|e| format!("Could not open {}: trace: {}", target.file.display(), e))?;
    let mut reader = BufReader::new(file);

    let mut session = client.session().await?;
    let mut transaction = session.transaction().await?;
    let rows = copy.run(transaction.as_mut(), &mut reader).await?;
    transaction.commit().await?;

    print_success_message(&format!(
        "{} rows copied into {}.{}",
        rows, target.schema, target.table
    ));

    Ok(())
}

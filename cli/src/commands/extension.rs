use pgstage::{ensure_extension_installed, PostgresClient};

use crate::console::print_success_message;

pub async fn handle_install_extension_command(
    client: &PostgresClient,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_extension_installed(client, name).await.map_err(|e| {
        format!(
            "Could not install extension {}, the database user may lack the privilege: trace: {}",
            name, e
        )
    })?;

    print_success_message(&format!("Extension {} is installed", name));

    Ok(())
}

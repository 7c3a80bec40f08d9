//! YAML job manifests describing one staged operation.
//!
//! ```yaml
//! table: prices
//! schema: market
//! operation: upsert
//! columns: [ticker, day, close]
//! upsert_clause: WHERE current.day < EXCLUDED.day
//! copy:
//!   delimiter: "|"
//!   header: false
//!   encoding: ${PRICES_ENCODING}
//! ```
//!
//! `${VAR}` references are replaced from the environment before parsing.

use std::{env, fs, path::Path};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::database::postgres::{
    copy::CopyOptions,
    staged::OperationKind,
    table::{order_table_columns, Table, TableError, DEFAULT_SCHEMA},
};

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("Could not open file: {0}")]
    CouldNotOpenFile(#[from] std::io::Error),

    #[error("Could not parse manifest: {0}")]
    CouldNotParseManifest(#[from] serde_yaml::Error),

    #[error("Could not substitute env variables: {0}")]
    CouldNotSubstituteEnvVariables(#[from] regex::Error),

    #[error("Environment variable {0} not found")]
    EnvironmentVariableNotFound(String),

    #[error("upsert_clause is only valid for upsert operations")]
    ClauseWithoutUpsert,

    #[error("{0}")]
    Schema(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    pub operation: Operation,

    /// Column order of the loaded file. Defaults to the table's own order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_clause: Option<String>,

    #[serde(default)]
    pub copy: CopyOptions,
}

fn substitute_env_variables(contents: &str) -> Result<String, ManifestError> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;

    let mut missing = None;
    let result = re.replace_all(contents, |caps: &Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(ManifestError::EnvironmentVariableNotFound(var_name)),
        None => Ok(result.into_owned()),
    }
}

impl Manifest {
    pub fn from_yaml(contents: &str) -> Result<Self, ManifestError> {
        let contents = substitute_env_variables(contents)?;
        let manifest: Manifest = serde_yaml::from_str(&contents)?;

        if manifest.upsert_clause.is_some() && manifest.operation != Operation::Upsert {
            return Err(ManifestError::ClauseWithoutUpsert);
        }

        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn operation_kind(&self) -> OperationKind {
        match self.operation {
            Operation::Upsert => OperationKind::Upsert { clause: self.upsert_clause.clone() },
            Operation::Delete => OperationKind::Delete,
        }
    }

    /// Applies the manifest's column order to a reflected table.
    pub fn shape_table(&self, table: Table) -> Result<Table, ManifestError> {
        match &self.columns {
            Some(columns) => Ok(order_table_columns(&table, columns)?),
            None => Ok(table),
        }
    }
}

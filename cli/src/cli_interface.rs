use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use pgstage::CopyOptions;

#[allow(clippy::upper_case_acronyms)]
#[derive(Parser, Debug)]
#[clap(
    name = "pgstage",
    version,
    about = "Staged bulk upserts and deletes for PostgreSQL",
    long_about = None
)]
pub struct CLI {
    /// Log more, `-v` for debug and `-vv` for trace.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[clap(short, long, global = true)]
    pub quiet: bool,

    /// optional - The connection string, defaults to DATABASE_URL (a .env file is read).
    #[clap(long, global = true)]
    pub database_url: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// The target table.
    #[clap(long, short)]
    pub table: String,

    #[clap(long, short, default_value = "public")]
    pub schema: String,

    /// The delimited file to load.
    #[clap(long, short)]
    pub file: PathBuf,

    /// optional - Column order of the file, comma separated, defaults to the table's order.
    #[clap(long, value_delimiter = ',')]
    pub columns: Option<Vec<String>>,
}

#[derive(Args, Debug, Clone)]
pub struct CopyArgs {
    #[clap(long, default_value_t = ',')]
    pub delimiter: char,

    #[clap(long, default_value = "utf8")]
    pub encoding: String,

    /// The string that represents a null value, empty by default.
    #[clap(long = "null")]
    pub null_str: Option<String>,

    /// The file has no header row.
    #[clap(long)]
    pub no_header: bool,

    #[clap(long, default_value_t = '"')]
    pub quote: char,

    #[clap(long, default_value_t = '\\')]
    pub escape: char,

    /// Columns whose values are never matched against the null string.
    #[clap(long, value_delimiter = ',')]
    pub force_not_null: Option<Vec<String>>,

    /// Columns whose quoted values are also matched against the null string.
    #[clap(long, value_delimiter = ',')]
    pub force_null: Option<Vec<String>>,
}

impl CopyArgs {
    pub fn to_copy_options(&self) -> CopyOptions {
        CopyOptions {
            delimiter: self.delimiter,
            encoding: self.encoding.clone(),
            null_str: self.null_str.clone().unwrap_or_default(),
            header: !self.no_header,
            quote_char: self.quote,
            escape_char: self.escape,
            force_not_null: self.force_not_null.clone(),
            force_null: self.force_null.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inserts the rows of a file, updating rows whose primary key already exists.
    ///
    /// Example:
    /// `pgstage upsert --table prices --file prices.csv --clause "WHERE current.day < EXCLUDED.day"`
    #[clap(name = "upsert")]
    Upsert {
        #[clap(flatten)]
        target: TargetArgs,

        #[clap(flatten)]
        copy: CopyArgs,

        /// optional - Appended after the `DO UPDATE SET`, the target is aliased as `current`.
        #[clap(long)]
        clause: Option<String>,
    },

    /// Deletes every row whose primary key appears in a file of key columns.
    ///
    /// Example:
    /// `pgstage delete --table prices --file stale_keys.csv`
    #[clap(name = "delete")]
    Delete {
        #[clap(flatten)]
        target: TargetArgs,

        #[clap(flatten)]
        copy: CopyArgs,
    },

    /// Copies a file straight into a table without staging.
    ///
    /// Example:
    /// `pgstage copy --table prices --file prices.csv --no-header`
    #[clap(name = "copy")]
    Copy {
        #[clap(flatten)]
        target: TargetArgs,

        #[clap(flatten)]
        copy: CopyArgs,
    },

    /// Runs the staged operation described by a YAML manifest.
    ///
    /// Example:
    /// `pgstage run --manifest prices.yaml --file prices.csv`
    #[clap(name = "run")]
    Run {
        #[clap(long, short)]
        manifest: PathBuf,

        #[clap(long, short)]
        file: PathBuf,
    },

    /// Installs a server extension if it is not installed yet.
    ///
    /// Example:
    /// `pgstage install-extension pgcrypto`
    #[clap(name = "install-extension")]
    InstallExtension { name: String },
}

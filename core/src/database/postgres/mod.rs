pub mod admin;
pub mod client;
pub mod copy;
pub mod ddl;
pub mod dml;
pub mod encodings;
pub mod sql;
pub mod staged;
pub mod staging;
pub mod table;

#[cfg(test)]
pub(crate) mod test_session;

pub mod postgres;
pub mod sql_type_wrapper;

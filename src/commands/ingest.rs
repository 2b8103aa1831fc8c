mod db_setup;
mod error;
mod fetch;
mod geometry;
mod indicators;
mod infrastructure;
mod pipeline;
mod regions;
mod run;
mod tabular;
#[cfg(test)]
mod tests;

pub use db_setup::{count_rows, get_metadata};
pub use run::run;

mod limits;
mod types;

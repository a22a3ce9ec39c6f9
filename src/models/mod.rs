//! Plain data types shared by every layer.

pub mod command;
pub mod engine;
pub mod value;

pub use command::{
    Command, CommandType, DbType, OutputValues, Parameter, ParameterDirection,
};
pub use engine::Engine;
pub use value::{DbValue, FromDbValue};

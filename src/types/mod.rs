pub mod ast;
pub mod output;

mod defer;

pub use defer::Defer;

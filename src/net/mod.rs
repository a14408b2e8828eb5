//! Socket-level helpers

mod fwmark;

pub use fwmark::set_socket_mark;

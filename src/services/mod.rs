pub mod mirror;

pub use mirror::{MirrorReport, MirrorService};

mod matcher;

pub use matcher::{glob_to_regex, parse_target, Router, Target};

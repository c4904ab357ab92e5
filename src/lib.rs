pub mod backend;
pub mod config;
pub mod context;
pub mod grouping;
pub mod policy;
pub mod scanner;
pub mod scheduler;
pub mod tagwriter;
pub mod track;

/// Audio file extensions we look at (everything lofty can tag)
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "spx", "wav", "aif", "aiff",
    // MP4 family
    "m4a", "mp4", "aac",
    // Lossless with APE tags
    "ape", "wv", "mpc",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "rgsweep";

pub mod presets;
pub mod serve;
pub mod transcode;

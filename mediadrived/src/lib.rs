pub mod daemon;
pub mod media;
pub mod provider;
pub mod server;
pub mod settings;
pub mod sync;
pub mod transcode;

#[cfg(test)]
mod test_support;

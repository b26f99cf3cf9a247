pub mod classifier;
pub mod config;
pub mod model;
pub mod normalize;
pub mod server;
pub mod train;

/// Process-wide helpers shared by both binaries
pub mod util {
    use once_cell::sync::Lazy;
    use tch::Device;
    use tracing_subscriber::EnvFilter;

    /// The device every model in this process runs on. Picked once.
    pub static DEVICE: Lazy<Device> = Lazy::new(Device::cuda_if_available);

    /// Install the fmt subscriber. `RUST_LOG` wins over `default_level`
    pub fn init_tracing(default_level: &str) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

}

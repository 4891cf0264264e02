use crate::config::ConfigSnapshot;

pub enum WorkerEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(ConfigSnapshot),
    /// Ctrl+C received; the worker should release its surfaces and exit.
    Shutdown,
}

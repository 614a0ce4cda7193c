mod backup_restore;
mod local_producer;
mod multicast_bind;
mod unicast_map;
mod zero_fill;

pub use backup_restore::BackupRestoreStage;
pub use local_producer::LocalProducer;
pub use multicast_bind::MulticastBindStage;
pub use unicast_map::UnicastMapStage;
pub use zero_fill::ZeroFillStage;

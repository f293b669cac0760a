// gridsync-common: wire types shared by the relay and grid clients

pub mod presence;
pub mod protocol;
pub mod room;

pub mod assessment;
pub mod audio;
pub mod delivery;
pub mod keepalive;
pub mod realtime;
pub mod report;
pub mod scoring;
pub mod tracker;

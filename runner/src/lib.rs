pub mod artifact;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod dispatch;
pub mod distributed;
pub mod job;
pub mod publisher;
pub mod status;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod discovery_test;
#[cfg(test)]
mod dispatch_test;
#[cfg(test)]
mod status_test;
#[cfg(test)]
mod transport_test;
#[cfg(test)]
mod worker_test;

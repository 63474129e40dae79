//! Motion telemetry to simulator command runtime.

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod imu;
pub mod kinematics;
pub mod mapper;
pub mod modality;
pub mod normalize;
pub mod observation;
pub mod recorder;
pub mod remote;
pub mod session;
pub mod transport;

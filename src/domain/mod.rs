pub mod events;
pub mod joint_angle;
pub mod models;
pub mod recording;
pub mod registry;
pub mod settings;

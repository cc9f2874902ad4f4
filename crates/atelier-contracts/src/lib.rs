pub mod collaborators;
pub mod events;
pub mod models;
pub mod pipeline;
pub mod runs;
pub mod tasks;

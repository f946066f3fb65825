pub mod highscores;
pub mod middleware;
pub mod provenance;
pub mod server;
pub mod telemetry;
pub mod users;

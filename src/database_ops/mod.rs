pub mod alerts;
pub mod canonical;
pub mod claims;
pub mod db;
pub mod dedupe;
pub mod exchange;
pub mod media;
pub mod prices;
pub mod sources;

//! Backend for a catering BEO (banquet event order) digitization workflow.
//!
//! PDFs of event orders are uploaded, rendered to per-page images, walked
//! through a keep/discard review pass that splits a packet into individual
//! BEOs, then annotated and laid out on a weekly calendar board.

pub mod api;
pub mod db;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod review;
pub mod server;
pub mod storage;

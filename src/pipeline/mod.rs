//! Message types shared by the capture, recognition, turn and playback stages.

pub mod messages;

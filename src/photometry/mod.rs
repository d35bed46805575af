//! Signal processing for multiplexed fiber photometry: demodulation of the
//! carrier-modulated raw acquisition, and alignment of the recovered traces
//! onto the behavioral task clock.

pub mod demodulation;
pub mod frame;
pub mod preprocess;

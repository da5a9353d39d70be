pub mod classifier;
pub mod fund_name;
pub mod funds;
pub mod identity;
pub mod merger;
pub mod normalizer;
pub mod pipeline;
pub mod similarity;
pub mod source;

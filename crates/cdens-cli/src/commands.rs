pub mod fit;
pub mod run;

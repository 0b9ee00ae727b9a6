pub mod gateway;
pub mod onboard;
pub mod run;
pub mod tools;

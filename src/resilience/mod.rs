//! 弹性层：重试策略、熔断器、带重试的调用执行器

pub mod breaker;
pub mod executor;
pub mod policy;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreakers, Permit};
pub use executor::{CallOptions, Resilience};
pub use policy::RetryPolicy;

pub mod greedy;
pub mod min_p;
pub mod sampler;
pub mod temperature;
pub mod top_k;
pub mod top_p;

pub use greedy::{DistSampler, GreedySampler, DEFAULT_SEED};
pub use min_p::MinPSampler;
pub use sampler::{Sampler, SamplerChain, SamplerParams, TokenLogit};
pub use temperature::TemperatureSampler;
pub use top_k::TopKSampler;
pub use top_p::TopPSampler;

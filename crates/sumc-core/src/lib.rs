pub mod errors;
pub mod numeric;
pub mod params;
pub mod proxy;

pub use errors::{SumcError, SumcResult};
pub use params::{ParameterPrior, SamplingBounds};
pub use proxy::{KrigingType, KrigingWeights, ResponseProxy};

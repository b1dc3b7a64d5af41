use crate::error::Error;
use crate::tensor::{Elem, Shape, Tensor};
use crate::util::{check_shape, numel};
use rand_distr::{Distribution, Normal, Uniform};

use std::fmt;
use std::str::FromStr;

/// Standard deviation of the `gaussian` scheme.
pub const GAUSSIAN_STD: Elem = 0.2;

/// Weight initialization schemes, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitScheme {
    /// Normal(0, 0.2) per element.
    #[default]
    Gaussian,
    Zeros,
    Ones,
    /// Normal(0, sqrt(2 / (fan_in + fan_out))).
    Xavier,
    /// Uniform(-sqrt(6 / fan_in), sqrt(6 / fan_in)).
    Kaiming,
}

impl FromStr for InitScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaussian" => Ok(InitScheme::Gaussian),
            "zeros" => Ok(InitScheme::Zeros),
            "ones" => Ok(InitScheme::Ones),
            "xavier" => Ok(InitScheme::Xavier),
            "kaiming" => Ok(InitScheme::Kaiming),
            other => Err(Error::UnknownInitScheme(other.to_string())),
        }
    }
}

impl fmt::Display for InitScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InitScheme::Gaussian => write!(f, "gaussian"),
            InitScheme::Zeros => write!(f, "zeros"),
            InitScheme::Ones => write!(f, "ones"),
            InitScheme::Xavier => write!(f, "xavier"),
            InitScheme::Kaiming => write!(f, "kaiming"),
        }
    }
}

/// Fan-in and fan-out of a weight laid out as (N, C, out, in):
/// `fan_in = C * W`, `fan_out = C * H`.
pub fn fans(shape: &Shape) -> (usize, usize) {
    (shape[1] * shape[3], shape[1] * shape[2])
}

fn sample<D: Distribution<Elem>>(dist: D, shape: Shape) -> Result<Tensor, Error> {
    let mut rng = rand::rng();
    let data: Vec<Elem> = (0..numel(&shape)).map(|_| dist.sample(&mut rng)).collect();
    Tensor::from_vec(shape, data)
}

/// Samples every element from Normal(0, std).
pub fn gaussian(shape: Shape, std: Elem) -> Result<Tensor, Error> {
    check_shape(&shape)?;
    let dist = Normal::new(0.0, std).map_err(|_| Error::InitializationError)?;
    sample(dist, shape)
}

/// Xavier/Glorot normal initialization.
pub fn xavier_normal(shape: Shape) -> Result<Tensor, Error> {
    check_shape(&shape)?;
    let (fan_in, fan_out) = fans(&shape);
    let std = (2.0 / (fan_in + fan_out) as Elem).sqrt();
    gaussian(shape, std)
}

/// Initialize weights using Kaiming uniform initialization.
pub fn kaiming_uniform(fan_in: usize, shape: Shape) -> Result<Tensor, Error> {
    check_shape(&shape)?;
    if fan_in == 0 {
        return Err(Error::InvalidOperation(
            "Fan-in cannot be zero for Kaiming initialization".to_string(),
        ));
    }

    // Calculate bounds for uniform distribution: bound = sqrt(6 / fan_in)
    let bound = (6.0 / fan_in as Elem).sqrt();
    if bound.is_nan() || bound.is_infinite() {
        return Err(Error::InitializationError);
    }
    let dist = Uniform::new(-bound, bound).map_err(|_| Error::InitializationError)?;
    sample(dist, shape)
}

/// Builds a tensor of `shape` using `scheme`.
pub fn initialize(scheme: InitScheme, shape: Shape) -> Result<Tensor, Error> {
    match scheme {
        InitScheme::Gaussian => gaussian(shape, GAUSSIAN_STD),
        InitScheme::Zeros => Tensor::zeros(shape),
        InitScheme::Ones => Tensor::ones(shape),
        InitScheme::Xavier => xavier_normal(shape),
        InitScheme::Kaiming => kaiming_uniform(fans(&shape).0, shape),
    }
}

//! The context threaded through layer construction.
//!
//! A [`GraphBuilder`] owns the parameters of a model keyed by their scope path, for example
//! `generator/encoder/resblock/res1/conv/kernel`. Layers create their parameters lazily on the
//! first call under a path and reuse them afterwards.
use super::{
    autograd::{Parameter, ParameterD},
    init::Initializer,
};
use crate::error::ShapeMismatch;
use anyhow::{bail, Result};
use ndarray::{Dimension, IntoDimension};
use rand::{rngs::StdRng, SeedableRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// L2 coefficient applied to convolution and dense kernels.
pub const WEIGHT_DECAY: f32 = 0.5 * 1e-4;

/// The network a layer belongs to.
///
/// Discriminator convolutions are initialized from a narrow normal distribution, everything
/// else uses variance scaling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Role {
    /// Generators, encoders and decoders.
    #[default]
    Generator,
    /// Discriminators.
    Discriminator,
}

impl Role {
    /// The role implied by a scope path, [`Discriminator`](Role::Discriminator) if it contains
    /// `"discriminator"`.
    pub fn from_scope(path: &str) -> Self {
        if path.contains("discriminator") {
            Self::Discriminator
        } else {
            Self::Generator
        }
    }
}

/// Options for a [`GraphBuilder`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct GraphOptions {
    /// Seed for parameter initialization. Uses entropy if `None`.
    pub seed: Option<u64>,
    /// L2 coefficient registered for kernels.
    pub weight_decay: f32,
    /// Whether created parameters compute gradients.
    pub training: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            seed: None,
            weight_decay: WEIGHT_DECAY,
            training: false,
        }
    }
}

impl GraphOptions {
    /// Seeds parameter initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed.replace(seed);
        self
    }
    /// Sets the L2 coefficient.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
    /// Enables / disables gradients for created parameters.
    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }
}

/// Builds a model, owning its parameters and regularizers.
///
/// Scopes are entered with [`.scope()`](Self::scope), which appends a name to the current path
/// for the duration of a closure. The same name in sibling scopes yields independent
/// parameters, re-entering a path reuses them.
#[derive(Debug)]
pub struct GraphBuilder {
    options: GraphOptions,
    role: Role,
    scopes: Vec<String>,
    rng: StdRng,
    parameters: BTreeMap<String, ParameterD>,
    regularizers: BTreeMap<String, f32>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(GraphOptions::default())
    }
}

impl GraphBuilder {
    /// Creates a builder with `options`.
    pub fn new(options: GraphOptions) -> Self {
        let rng = if let Some(seed) = options.seed {
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };
        Self {
            options,
            role: Role::default(),
            scopes: Vec::new(),
            rng,
            parameters: BTreeMap::new(),
            regularizers: BTreeMap::new(),
        }
    }
    /// The options.
    pub fn options(&self) -> &GraphOptions {
        &self.options
    }
    /// The current role.
    pub fn role(&self) -> Role {
        self.role
    }
    /// The current scope path, names joined with `/`.
    pub fn scope_path(&self) -> String {
        self.scopes.join("/")
    }
    fn path_of(&self, name: &str) -> String {
        if self.scopes.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.scope_path())
        }
    }
    /// Runs `f` within the child scope `name`.
    ///
    /// The scope is left even if `f` fails.
    pub fn scope<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if name.is_empty() || name.contains('/') {
            bail!("invalid scope name {name:?}");
        }
        self.scopes.push(name.to_string());
        let output = f(self);
        self.scopes.pop();
        output
    }
    /// Runs `f` with `role`.
    pub fn with_role<T>(&mut self, role: Role, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let prev = std::mem::replace(&mut self.role, role);
        let output = f(self);
        self.role = prev;
        output
    }
    /// The parameter `name` in the current scope.
    ///
    /// Created with `init` on first use, afterwards the existing parameter is returned.
    ///
    /// **Errors**
    ///
    /// - The existing parameter has a different shape.
    /// - The initializer failed.
    pub fn parameter<E>(
        &mut self,
        name: &str,
        dim: E,
        init: &dyn Initializer,
    ) -> Result<Parameter<E::Dim>>
    where
        E: IntoDimension,
    {
        let dim = dim.into_dimension();
        let path = self.path_of(name);
        if let Some(parameter) = self.parameters.get(&path) {
            if parameter.shape() != dim.slice() {
                bail!(ShapeMismatch::new("parameter", parameter.shape(), dim.slice()));
            }
            log::trace!("reusing parameter {path}");
            return Ok(parameter.clone().into_dimensionality()?);
        }
        let mut parameter = ParameterD::from(init.init(dim.slice(), &mut self.rng)?);
        parameter.set_training(self.options.training);
        log::debug!("created parameter {path} {:?} with {init:?}", dim.slice());
        self.parameters.insert(path, parameter.clone());
        Ok(parameter.into_dimensionality()?)
    }
    /// Registers the parameter `name` in the current scope for L2 regularization with the
    /// configured weight decay.
    pub fn regularize(&mut self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        if !self.parameters.contains_key(&path) {
            bail!("can not regularize unknown parameter {path:?}");
        }
        if !self.regularizers.contains_key(&path) {
            log::trace!("regularizing {path} with {}", self.options.weight_decay);
            self.regularizers.insert(path, self.options.weight_decay);
        }
        Ok(())
    }
    /// The parameter at `path`.
    pub fn get(&self, path: &str) -> Option<&ParameterD> {
        self.parameters.get(path)
    }
    /// The number of parameters.
    pub fn parameters_len(&self) -> usize {
        self.parameters.len()
    }
    /// Enumerates the parameters with their paths, ordered by path.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &ParameterD)> {
        self.parameters.iter().map(|(path, p)| (path.as_str(), p))
    }
    /// Enumerates mutable references to the parameters with their paths.
    ///
    /// Parameters previously returned by [`.parameter()`](Self::parameter) share gradients, not
    /// values, with these.
    pub fn parameters_mut(&mut self) -> impl Iterator<Item = (&str, &mut ParameterD)> {
        self.parameters.iter_mut().map(|(path, p)| (path.as_str(), p))
    }
    /// Enumerates regularized parameters with their paths and coefficients.
    pub fn regularized(&self) -> impl Iterator<Item = (&str, &ParameterD, f32)> {
        self.regularizers.iter().filter_map(|(path, coefficient)| {
            let parameter = self.parameters.get(path)?;
            Some((path.as_str(), parameter, *coefficient))
        })
    }
    /// Enables / disables training of all parameters.
    ///
    /// See [`Parameter::set_training()`].
    pub fn set_training(&mut self, training: bool) {
        self.options.training = training;
        for parameter in self.parameters.values_mut() {
            parameter.set_training(training);
        }
    }
}

use crate::{
    error::ShapeMismatch,
    tensor::{flatten, into_standard_layout, ArcTensor, ArcTensorD},
};
use anyhow::{anyhow, bail, ensure, Result};
use ndarray::{
    linalg::Dot, Array, ArcArray, Axis, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix3, Ix4, IxDyn,
    ShapeError, Zip,
};
use parking_lot::{Mutex, RwLock};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use munit_nn::{tensor::ArcTensor2, neural_network::autograd::{Variable, Variable2}};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcTensor2| -> Result<ArcTensor2> { todo!() });
    /// }
    /// let output_value: ArcTensor2 = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<Arc<RwLock<Option<ArcTensorD>>>>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added. Used to mark inputs that
        /// require a gradient.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcTensor<D>) -> Result<ArcTensor<D2>> + Send + Sync + 'static,
        {
            let grad = self
                .grad
                .get_or_insert_with(|| Arc::new(RwLock::default()))
                .clone();
            let mut output_grad_lock = Some(grad);
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .ok_or_else(|| anyhow!("{name}: output gradient was not computed"))?;
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad.into_dimensionality()?)?;
                    ensure!(
                        grad.shape() == dim.slice(),
                        ShapeMismatch::new(name, dim.slice(), grad.shape())
                    );
                    let grad = grad.into_dyn();
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        input_grad.zip_mut_with(&grad, |x, y| *x += y);
                    } else {
                        guard.replace(grad);
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcTensor<D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: Arc<RwLock<Option<ArcTensorD>>>,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    /// The number of edges into each node reachable from `root`, with the reachable nodes.
    ///
    /// Edges from nodes outside of this subgraph are not counted, so that variables that are
    /// still alive but not part of the backward pass do not block it.
    fn pending_edges(root: &Arc<Self>) -> (HashMap<*const Self, usize>, Vec<Arc<Self>>) {
        let mut pending = HashMap::new();
        let mut nodes = vec![root.clone()];
        let mut visited = HashSet::from([Arc::as_ptr(root)]);
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            for edge in node.edges.lock().iter() {
                let key = Arc::as_ptr(&edge.node);
                *pending.entry(key).or_insert(0) += 1;
                if visited.insert(key) {
                    nodes.push(edge.node.clone());
                    stack.push(edge.node.clone());
                }
            }
        }
        (pending, nodes)
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: Arc<RwLock<Option<ArcTensorD>>>, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcArray::ones(self.inner.dim.clone()).into_dimensionality::<D>()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    pub fn backward_grad(&self, grad: ArcTensor<D>) -> Result<()> {
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        // nodes keeps the subgraph alive, so the keys of pending stay valid
        let (mut pending, _nodes) = NodeInner::pending_edges(&self.inner);
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if let Some(count) = pending.get_mut(&Arc::as_ptr(&node)) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(node);
                    }
                }
            }
        }
        Ok(())
    }
    fn into_dyn(self) -> Node<IxDyn> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are tensors with an optional [`Node`] that stores a gradient. Numerical operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from tensors via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcTensor<D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Converts the variable into a tensor.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// The gradient, if the variable has a node and the backward pass reached it.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.node.as_ref()?.grad()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
    /// The scalar value.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
    /// A constant zero, without a node.
    pub fn zero() -> Self {
        Self::from(ArcArray::from_elem((), 0.))
    }
}

impl<D: Dimension + 'static> Variable<D> {
    /// Converts into `shape`.
    ///
    /// The value is converted to standard layout first if necessary.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::<E::Dim>::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(into_standard_layout(output_grad).into_shape(dim)?)
            });
        }
        let value = into_standard_layout(self.value).into_shape(shape)?;
        Ok(builder.build(value))
    }
    /// Flattens the variable into `[batch, features]`.
    pub fn flatten(self) -> Result<Variable2> {
        let dim = flatten(self.shape());
        self.into_shape(dim)
    }
    /// Sums `grad` into `dim`, reversing a broadcast of `dim` into the shape of `grad`.
    fn unbroadcast<D2: Dimension>(grad: Array<f32, D>, dim: D2) -> Result<ArcTensor<D2>> {
        let mut grad = grad.into_dyn();
        while grad.ndim() > dim.ndim() {
            grad = grad.sum_axis(Axis(0));
        }
        for (axis, n) in dim.slice().iter().copied().enumerate() {
            if n == 1 && grad.shape()[axis] != 1 {
                grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
            }
        }
        Ok(grad.into_shape(dim)?.into_shared())
    }
    fn broadcast_rhs<D2: Dimension>(
        &self,
        op: &'static str,
        rhs: &Variable<D2>,
    ) -> Result<ArcTensor<D>> {
        rhs.value
            .broadcast(self.raw_dim())
            .map(|rhs| rhs.to_shared())
            .ok_or_else(|| ShapeMismatch::new(op, self.shape(), rhs.shape()).into())
    }
    /// Adds `rhs`, broadcasting it into the shape of `self`.
    pub fn add<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        let rhs_value = self.broadcast_rhs("add", rhs)?;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| {
                Self::unbroadcast(output_grad.into_owned(), dim)
            });
        }
        Ok(builder.build((&self.value + &rhs_value).into_shared()))
    }
    /// Subtracts `rhs`, broadcasting it into the shape of `self`.
    pub fn sub<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        let rhs_value = self.broadcast_rhs("sub", rhs)?;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| {
                Self::unbroadcast(-output_grad.into_owned(), dim)
            });
        }
        Ok(builder.build((&self.value - &rhs_value).into_shared()))
    }
    /// Multiplies by `rhs`, broadcasting it into the shape of `self`.
    pub fn mul<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        let rhs_value = self.broadcast_rhs("mul", rhs)?;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let rhs_value = rhs_value.clone();
            builder.edge(node, move |output_grad| {
                Ok((&output_grad * &rhs_value).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs_value = self.value.clone();
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| {
                Self::unbroadcast(&output_grad * &lhs_value, dim)
            });
        }
        Ok(builder.build((&self.value * &rhs_value).into_shared()))
    }
    /// Divides by `rhs`, broadcasting it into the shape of `self`.
    pub fn div<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        let rhs_value = self.broadcast_rhs("div", rhs)?;
        let output = (&self.value / &rhs_value).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let rhs_value = rhs_value.clone();
            builder.edge(node, move |output_grad| {
                Ok((&output_grad / &rhs_value).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let output = output.clone();
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| {
                let mut grad = output_grad.into_owned();
                Zip::from(&mut grad)
                    .and(&output)
                    .and(&rhs_value)
                    .for_each(|dy, y, r| *dy = -*dy * y / r);
                Self::unbroadcast(grad, dim)
            });
        }
        Ok(builder.build(output))
    }
    /// Applies `f` elementwise.
    ///
    /// `df(x, y)` is the derivative of `f` at `x`, where `y = f(x)`.
    fn unary<F, G>(&self, f: F, df: G) -> Self
    where
        F: Fn(f32) -> f32,
        G: Fn(f32, f32) -> f32 + Send + Sync + 'static,
    {
        let output = self.value.map(|x| f(*x)).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let input = self.value.clone();
            let output = output.clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = output_grad.into_owned();
                Zip::from(&mut input_grad)
                    .and(&input)
                    .and(&output)
                    .for_each(|dy, x, y| *dy *= df(*x, *y));
                Ok(input_grad.into_shared())
            });
        }
        builder.build(output)
    }
    /// Adds a constant.
    pub fn add_scalar(&self, alpha: f32) -> Self {
        self.unary(|x| x + alpha, |_, _| 1.)
    }
    /// Multiplies by a constant.
    pub fn mul_scalar(&self, alpha: f32) -> Self {
        self.unary(|x| x * alpha, move |_, _| alpha)
    }
    /// Squares each element.
    pub fn square(&self) -> Self {
        self.unary(|x| x * x, |x, _| 2. * x)
    }
    /// The square root of each element.
    pub fn sqrt(&self) -> Self {
        self.unary(f32::sqrt, |_, y| 0.5 / y)
    }
    /// The absolute value of each element.
    ///
    /// The gradient at 0 is 0.
    pub fn abs(&self) -> Self {
        self.unary(f32::abs, |x, _| {
            if x > 0. {
                1.
            } else if x < 0. {
                -1.
            } else {
                0.
            }
        })
    }
    /// Rectified linear unit, `max(x, 0)`.
    pub fn relu(&self) -> Self {
        self.unary(|x| x.max(0.), |x, _| if x > 0. { 1. } else { 0. })
    }
    /// Leaky rectified linear unit, `x` if positive else `alpha * x`.
    pub fn leaky_relu(&self, alpha: f32) -> Self {
        self.unary(
            move |x| if x > 0. { x } else { alpha * x },
            move |x, _| if x > 0. { 1. } else { alpha },
        )
    }
    /// Hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        self.unary(f32::tanh, |_, y| 1. - y * y)
    }
    /// Sigmoid cross entropy between the logits `self` and the constant `label`.
    ///
    /// Computed as `max(x, 0) - x * z + ln(1 + exp(-|x|))`, which does not overflow for large
    /// logits.
    pub fn sigmoid_cross_entropy_with_logits(&self, label: f32) -> Self {
        self.unary(
            move |x| x.max(0.) - x * label + (-x.abs()).exp().ln_1p(),
            move |x, _| 1. / (1. + (-x).exp()) - label,
        )
    }
    /// Sums all elements.
    pub fn sum(&self) -> Variable0 {
        let mut builder = Variable0::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<Ix0>| {
                Ok(ArcArray::from_elem(dim, output_grad[()]))
            });
        }
        builder.build(ArcArray::from_elem((), self.value.sum()))
    }
    /// The mean of all elements.
    pub fn mean(&self) -> Variable0 {
        let n = self.value.len() as f32;
        self.sum().mul_scalar(1. / n)
    }
    /// The mean over `axes`, keeping the reduced axes with length 1.
    ///
    /// **Errors**
    ///
    /// - An axis is out of bounds.
    /// - An axis is repeated.
    pub fn mean_axes(&self, axes: &[usize]) -> Result<Self> {
        let ndim = self.value.ndim();
        if let Some(axis) = axes.iter().find(|axis| **axis >= ndim) {
            bail!("mean_axes: axis {axis} out of bounds for shape {:?}", self.shape());
        }
        for (i, axis) in axes.iter().enumerate() {
            ensure!(
                !axes[..i].contains(axis),
                "mean_axes: axis {axis} repeated in {axes:?}"
            );
        }
        let mut output = self.value.to_owned().into_dyn();
        let mut count = 1;
        for axis in axes.iter().copied() {
            count *= self.shape()[axis];
            output = output.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
        let scale = 1. / count as f32;
        output.mapv_inplace(|x| x * scale);
        let output = output.into_dimensionality::<D>()?;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad| {
                let input_grad = output_grad
                    .broadcast(dim.clone())
                    .ok_or_else(|| ShapeMismatch::new("mean_axes", dim.slice(), output_grad.shape()))?
                    .mapv(|dy| dy * scale);
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(output.into_shared()))
    }
}

impl Dot<Self> for Variable2 {
    type Output = Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        ensure!(
            lhs.dim().1 == rhs.dim().0,
            ShapeMismatch::new("dot", lhs.shape(), rhs.shape())
        );
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(tensor: Array<f32, D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Variable<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameters are the learnable weights of a layer. A Parameter
/// can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`], so that the backward pass
/// accumulates into [`.grad()`](Parameter::grad).
///
/// Clones share the gradient.
#[derive(Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))
)]
pub struct Parameter<D: Dimension> {
    value: ArcTensor<D>,
    #[cfg_attr(feature = "serde", serde(skip))]
    grad: Option<Arc<RwLock<Option<ArcTensorD>>>>,
}

/// Parameter with 1 element.
pub type Parameter0 = Parameter<Ix0>;
/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Borrows the value mutably.
    ///
    /// Copies the data if it is shared.
    pub fn value_mut(&mut self) -> &mut ArcTensor<D> {
        &mut self.value
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Whether variables created from the parameter will compute a gradient.
    pub fn training(&self) -> bool {
        self.grad.is_some()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Clears the gradient, keeping training enabled.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_ref() {
            grad.write().take();
        }
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(tensor: Array<f32, D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Parameter<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            grad: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("grad", &self.grad)
            .finish()
    }
}

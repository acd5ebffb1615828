//! Model components constructed through the entity registry.
//!
//! Layers and models only carry their structure and named parameters; the
//! tensor arithmetic of a forward pass lives outside this crate. Weights
//! start at zero and trained values arrive through checkpoints.

use crate::builder::{Args, Registry};
use crate::config::Config;
use crate::error::{BuildError, CheckpointError, ModelError};
use crate::state::{read_checkpoint, CheckpointNaming, Stateful};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub const GROUP_NET: &str = "babyseg.nn.GroupNet";
pub const ADAM: &str = "babyseg.nn.Adam";
pub const CONV: &str = "babyseg.nn.Conv";
pub const GROUP_CONV: &str = "babyseg.nn.GroupConv";

fn invalid(entity: &str, reason: impl Into<String>) -> BuildError {
    BuildError::InvalidArguments {
        entity: entity.to_string(),
        reason: reason.into(),
    }
}

/// Named tensor stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Parameter {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Parameter {
            shape,
            data: vec![0.0; n],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    fn is_consistent(&self) -> bool {
        self.shape.iter().product::<usize>() == self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Same,
    Valid,
    Size(usize),
}

impl Padding {
    fn from_value(entity: &str, value: &Value) -> Result<Self, BuildError> {
        match value {
            Value::String(s) if s == "same" => Ok(Padding::Same),
            Value::String(s) if s == "valid" => Ok(Padding::Valid),
            Value::Number(n) if n.is_u64() => Ok(Padding::Size(n.as_u64().unwrap_or_default() as usize)),
            _ => Err(invalid(
                entity,
                format!("padding {} is not \"same\", \"valid\" or a size", value),
            )),
        }
    }
}

/// `N`-dimensional convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    ndim: usize,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    padding: Padding,
    weight: Parameter,
    bias: Parameter,
}

impl Conv {
    pub fn new(
        ndim: usize,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: Padding,
    ) -> Result<Self, BuildError> {
        if !(1..=3).contains(&ndim) {
            return Err(invalid(CONV, format!("no {}-dimensional convolution", ndim)));
        }
        if in_channels == 0 || out_channels == 0 || kernel_size == 0 {
            return Err(invalid(CONV, "channels and kernel size must be positive"));
        }

        let mut shape = vec![out_channels, in_channels];
        shape.extend(std::iter::repeat(kernel_size).take(ndim));
        Ok(Conv {
            ndim,
            in_channels,
            out_channels,
            kernel_size,
            padding,
            weight: Parameter::zeros(shape),
            bias: Parameter::zeros(vec![out_channels]),
        })
    }

    /// Arguments `(ndim, in_channels, out_channels, kernel_size, padding)`.
    fn from_args(entity: &str, args: &Args) -> Result<Self, BuildError> {
        args.check(
            entity,
            5,
            &["ndim", "in_channels", "out_channels", "kernel_size", "padding"],
        )?;
        let required = |index: usize, name: &str| -> Result<usize, BuildError> {
            args.param(entity, Some(index), name)?
                .ok_or_else(|| invalid(entity, format!("missing argument \"{}\"", name)))
        };
        let ndim = required(0, "ndim")?;
        let in_channels = required(1, "in_channels")?;
        let out_channels = required(2, "out_channels")?;
        let kernel_size = required(3, "kernel_size")?;
        let padding = match args.param::<Value>(entity, Some(4), "padding")? {
            Some(value) => Padding::from_value(entity, &value)?,
            None => Padding::Size(0),
        };
        Conv::new(ndim, in_channels, out_channels, kernel_size, padding)
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        vec![("weight".to_string(), &self.weight), ("bias".to_string(), &self.bias)]
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        vec![
            ("weight".to_string(), &mut self.weight),
            ("bias".to_string(), &mut self.bias),
        ]
    }
}

/// Group convolution: a per-member branch and a branch on the group mean.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConv {
    pub conv_b: Conv,
    pub conv_m: Conv,
}

impl GroupConv {
    fn from_args(args: &Args) -> Result<Self, BuildError> {
        let conv_b = Conv::from_args(GROUP_CONV, args)?;
        let conv_m = conv_b.clone();
        Ok(GroupConv { conv_b, conv_m })
    }
}

/// Anything the layer registry constructs.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Conv(Conv),
    GroupConv(GroupConv),
}

impl Layer {
    fn conv(&self) -> &Conv {
        match self {
            Layer::Conv(conv) => conv,
            Layer::GroupConv(group) => &group.conv_b,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv().in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.conv().out_channels
    }

    pub fn parameters(&self) -> Vec<(String, &Parameter)> {
        match self {
            Layer::Conv(conv) => conv.parameters(),
            Layer::GroupConv(GroupConv { conv_b, conv_m }) => prefixed("conv_b", conv_b.parameters())
                .chain(prefixed("conv_m", conv_m.parameters()))
                .collect(),
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        match self {
            Layer::Conv(conv) => conv.parameters_mut(),
            Layer::GroupConv(GroupConv { conv_b, conv_m }) => {
                prefixed("conv_b", conv_b.parameters_mut())
                    .chain(prefixed("conv_m", conv_m.parameters_mut()))
                    .collect()
            }
        }
    }
}

fn prefixed<'a, P: 'a>(
    prefix: &'a str,
    params: Vec<(String, P)>,
) -> impl Iterator<Item = (String, P)> + 'a {
    params
        .into_iter()
        .map(move |(name, p)| (format!("{}.{}", prefix, name), p))
}

/// Registry of convolution layers addressable from model settings.
pub fn layer_registry() -> Result<Registry<Layer>, BuildError> {
    let mut registry = Registry::new();
    registry.register_type(CONV, |args: Args| Conv::from_args(CONV, &args).map(Layer::Conv))?;
    registry.register_type(GROUP_CONV, |args: Args| {
        GroupConv::from_args(&args).map(Layer::GroupConv)
    })?;
    Ok(registry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Elu,
    Relu,
    LeakyRelu,
    Gelu,
    Sigmoid,
    Tanh,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elu" => Ok(Activation::Elu),
            "relu" => Ok(Activation::Relu),
            "leakyrelu" | "leaky_relu" => Ok(Activation::LeakyRelu),
            "gelu" => Ok(Activation::Gelu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(format!("unknown activation \"{}\"", s)),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Elu => "elu",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leaky_relu",
            Activation::Gelu => "gelu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        };
        f.write_str(name)
    }
}

/// What the model registry produces.
pub trait Component: Stateful + fmt::Debug + Send {
    /// Registered entity name.
    fn entity(&self) -> &'static str;

    fn num_parameters(&self) -> usize {
        0
    }

    fn as_any(&self) -> &dyn Any;
}

/// `N`-dimensional U-Net built from group convolutions.
///
/// Each encoding level halves the spatial size, each decoding level doubles
/// it and concatenates the matching encoder output, so a decoding level's
/// successor sees its own filters plus the skip connection's.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNet {
    dim: usize,
    inp: usize,
    out: usize,
    rep: usize,
    act: Activation,
    clip: (f64, f64),
    enc: Vec<Vec<Layer>>,
    dec: Vec<Vec<Layer>>,
    add: Vec<Layer>,
}

impl GroupNet {
    /// Positional `(dim, inp, out)`; keywords `enc`, `dec`, `add`, `rep`,
    /// `act`, `conv`, `clip`.
    pub fn from_args(args: &Args, layers: &Registry<Layer>) -> Result<Self, BuildError> {
        args.check(
            GROUP_NET,
            3,
            &["dim", "inp", "out", "enc", "dec", "add", "rep", "act", "conv", "clip"],
        )?;
        let dim: usize = args.param(GROUP_NET, Some(0), "dim")?.unwrap_or(3);
        let inp: usize = args.param(GROUP_NET, Some(1), "inp")?.unwrap_or(1);
        let out: usize = args.param(GROUP_NET, Some(2), "out")?.unwrap_or(1);
        let enc: Vec<usize> = args
            .param(GROUP_NET, None, "enc")?
            .unwrap_or_else(|| vec![24, 48, 96, 192, 384]);
        let dec: Vec<usize> = args
            .param(GROUP_NET, None, "dec")?
            .unwrap_or_else(|| vec![384, 192, 96, 48, 24]);
        let add: Vec<usize> = args.param(GROUP_NET, None, "add")?.unwrap_or_default();
        let rep: usize = args.param(GROUP_NET, None, "rep")?.unwrap_or(1);
        let act = match args.param::<String>(GROUP_NET, None, "act")? {
            Some(name) => name.parse().map_err(|e: String| invalid(GROUP_NET, e))?,
            None => Activation::Elu,
        };
        let conv: Value = args
            .param(GROUP_NET, None, "conv")?
            .unwrap_or_else(|| Value::String(GROUP_CONV.to_string()));
        let clip: (f64, f64) = args.param(GROUP_NET, None, "clip")?.unwrap_or((0.01, 0.99));

        if !(1..=3).contains(&dim) {
            return Err(invalid(GROUP_NET, format!("no {}-dimensional model", dim)));
        }
        if !(0.0..=1.0).contains(&clip.0) || !(0.0..=1.0).contains(&clip.1) || clip.0 > clip.1 {
            return Err(invalid(
                GROUP_NET,
                format!("clip quantiles {:?} outside [0, 1]", clip),
            ));
        }

        let conv = layers.build(
            &conv,
            Args::new()
                .arg(dim)
                .kwarg("kernel_size", 3)
                .kwarg("padding", "same"),
            false,
        )?;
        let make = |n_inp: &mut usize, n_out: usize| -> Result<Vec<Layer>, BuildError> {
            let mut level = Vec::with_capacity(rep);
            for _ in 0..rep {
                level.push(conv.call(Args::new().arg(*n_inp).arg(n_out))?);
                *n_inp = n_out;
            }
            Ok(level)
        };

        let mut n_inp = inp;
        let mut encoder = Vec::with_capacity(enc.len());
        for &n_out in &enc {
            encoder.push(make(&mut n_inp, n_out)?);
        }

        let mut skips = enc;
        let mut decoder = Vec::with_capacity(dec.len());
        for &n_out in &dec {
            decoder.push(make(&mut n_inp, n_out)?);
            n_inp += skips
                .pop()
                .ok_or_else(|| invalid(GROUP_NET, "more decoding than encoding levels"))?;
        }

        let mut head = Vec::new();
        for &n_out in &add {
            head.extend(make(&mut n_inp, n_out)?);
        }
        head.push(conv.call(Args::new().arg(n_inp).arg(out))?);

        let model = GroupNet {
            dim,
            inp,
            out,
            rep,
            act,
            clip,
            enc: encoder,
            dec: decoder,
            add: head,
        };
        debug!("built model with {} parameters", model.num_parameters());
        Ok(model)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn activation(&self) -> Activation {
        self.act
    }

    pub fn clip(&self) -> (f64, f64) {
        self.clip
    }

    /// Input and output channels of every convolution, in order.
    pub fn channels(&self) -> Vec<(usize, usize)> {
        self.layers()
            .map(|layer| (layer.in_channels(), layer.out_channels()))
            .collect()
    }

    fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.enc
            .iter()
            .flatten()
            .chain(self.dec.iter().flatten())
            .chain(self.add.iter())
    }

    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.enc
            .iter_mut()
            .flatten()
            .chain(self.dec.iter_mut().flatten())
            .chain(self.add.iter_mut())
    }

    /// Layer names, with activations taking the odd positions in each level.
    fn prefixes(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (section, levels) in [("enc", &self.enc), ("dec", &self.dec)] {
            for (i, level) in levels.iter().enumerate() {
                names.extend((0..level.len()).map(|j| format!("{}.{}.{}", section, i, 2 * j)));
            }
        }
        names.extend((0..self.add.len()).map(|j| format!("add.{}", 2 * j)));
        names
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.prefixes()
            .iter()
            .zip(self.layers())
            .flat_map(|(prefix, layer)| {
                layer
                    .parameters()
                    .into_iter()
                    .map(move |(name, _)| format!("{}.{}", prefix, name))
            })
            .collect()
    }
}

impl Stateful for GroupNet {
    fn state_dict(&self) -> Value {
        let mut state = Map::new();
        for (prefix, layer) in self.prefixes().iter().zip(self.layers()) {
            for (name, param) in layer.parameters() {
                state.insert(
                    format!("{}.{}", prefix, name),
                    json!({"shape": param.shape, "data": param.data}),
                );
            }
        }
        Value::Object(state)
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<(), CheckpointError> {
        let state = state
            .as_object()
            .ok_or_else(|| CheckpointError::State("model state must be an object".to_string()))?;

        let expected: BTreeSet<String> = self.parameter_names().into_iter().collect();
        if let Some(key) = state.keys().find(|k| !expected.contains(*k)) {
            return Err(CheckpointError::State(format!("unexpected key \"{}\"", key)));
        }

        let prefixes = self.prefixes();
        for (prefix, layer) in prefixes.iter().zip(self.layers_mut()) {
            for (name, param) in layer.parameters_mut() {
                let key = format!("{}.{}", prefix, name);
                let value = state
                    .get(&key)
                    .ok_or_else(|| CheckpointError::State(format!("missing key \"{}\"", key)))?;
                let loaded: Parameter = serde_json::from_value(value.clone())
                    .map_err(|e| CheckpointError::State(format!("\"{}\": {}", key, e)))?;
                if loaded.shape != param.shape || !loaded.is_consistent() {
                    return Err(CheckpointError::State(format!(
                        "size mismatch for \"{}\": expected {:?}, found {:?} with {} values",
                        key,
                        param.shape,
                        loaded.shape,
                        loaded.numel()
                    )));
                }
                *param = loaded;
            }
        }
        Ok(())
    }
}

impl Component for GroupNet {
    fn entity(&self) -> &'static str {
        GROUP_NET
    }

    fn num_parameters(&self) -> usize {
        self.layers()
            .flat_map(|layer| layer.parameters())
            .map(|(_, param)| param.numel())
            .sum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Adam optimizer settings and step counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub step: u64,
}

impl Default for Adam {
    fn default() -> Self {
        Adam {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
            step: 0,
        }
    }
}

impl Adam {
    pub fn from_args(args: &Args) -> Result<Self, BuildError> {
        args.check(ADAM, 0, &["lr", "betas", "eps", "weight_decay"])?;
        let defaults = Adam::default();
        let adam = Adam {
            lr: args.param(ADAM, None, "lr")?.unwrap_or(defaults.lr),
            betas: args.param(ADAM, None, "betas")?.unwrap_or(defaults.betas),
            eps: args.param(ADAM, None, "eps")?.unwrap_or(defaults.eps),
            weight_decay: args
                .param(ADAM, None, "weight_decay")?
                .unwrap_or(defaults.weight_decay),
            step: 0,
        };

        if adam.lr < 0.0 || adam.eps < 0.0 || adam.weight_decay < 0.0 {
            return Err(invalid(ADAM, "lr, eps and weight_decay must be non-negative"));
        }
        if !(0.0..1.0).contains(&adam.betas.0) || !(0.0..1.0).contains(&adam.betas.1) {
            return Err(invalid(ADAM, format!("betas {:?} outside [0, 1)", adam.betas)));
        }
        Ok(adam)
    }
}

impl Stateful for Adam {
    fn state_dict(&self) -> Value {
        json!({
            "lr": self.lr,
            "betas": [self.betas.0, self.betas.1],
            "eps": self.eps,
            "weight_decay": self.weight_decay,
            "step": self.step,
        })
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<(), CheckpointError> {
        *self = serde_json::from_value(state.clone())
            .map_err(|e| CheckpointError::State(format!("optimizer: {}", e)))?;
        Ok(())
    }
}

impl Component for Adam {
    fn entity(&self) -> &'static str {
        ADAM
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry holding every model component by qualified name.
pub fn default_registry() -> Result<Registry<Box<dyn Component>>, BuildError> {
    let layers = Arc::new(layer_registry()?);
    let mut registry: Registry<Box<dyn Component>> = Registry::new();
    registry.register_type(GROUP_NET, move |args: Args| {
        let model = GroupNet::from_args(&args, &layers)?;
        Ok(Box::new(model) as Box<dyn Component>)
    })?;
    registry.register_type(ADAM, |args: Args| {
        Ok(Box::new(Adam::from_args(&args)?) as Box<dyn Component>)
    })?;
    Ok(registry)
}

/// Which weights `load_model` restores.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelInit {
    #[default]
    Latest,
    Epoch(u64),
    Path(PathBuf),
    None,
}

impl FromStr for ModelInit {
    type Err = Infallible;

    /// `latest`, an epoch number, or a checkpoint path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            return Ok(ModelInit::Latest);
        }
        Ok(match s.parse() {
            Ok(epoch) => ModelInit::Epoch(epoch),
            Err(_) => ModelInit::Path(PathBuf::from(s)),
        })
    }
}

/// Model together with the checkpoint its weights came from.
#[derive(Debug)]
pub struct LoadedModel {
    pub model: Box<dyn Component>,
    pub checkpoint: Option<PathBuf>,
}

/// Build `config[key]` and restore its weights.
pub fn load_model(config: &Config, init: &ModelInit, key: &str) -> Result<LoadedModel, ModelError> {
    load_model_with(&default_registry()?, config, init, key, Args::new())
}

/// `load_model` with an explicit registry and argument overrides.
///
/// The checkpoint entry under `key` is used when present, otherwise the whole
/// document.
pub fn load_model_with(
    registry: &Registry<Box<dyn Component>>,
    config: &Config,
    init: &ModelInit,
    key: &str,
    overrides: Args,
) -> Result<LoadedModel, ModelError> {
    let spec = config.lookup(&[key])?;
    let mut model = registry.construct(spec, overrides)?;

    let path = match init {
        ModelInit::None => {
            return Ok(LoadedModel {
                model,
                checkpoint: None,
            })
        }
        ModelInit::Path(path) => path.clone(),
        ModelInit::Epoch(epoch) => CheckpointNaming::from_config(config)?.path(*epoch)?,
        ModelInit::Latest => CheckpointNaming::from_config(config)?.latest()?.0,
    };

    let mut document = read_checkpoint(&path)?;
    let state = document.remove(key).unwrap_or(Value::Object(document));
    model.load_state_dict(&state)?;
    info!("loaded checkpoint \"{}\"", path.display());

    Ok(LoadedModel {
        model,
        checkpoint: Some(path),
    })
}

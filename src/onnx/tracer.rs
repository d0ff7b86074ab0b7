use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, PaddingConfig2d};
use burn::prelude::*;

use crate::error::ExportError;
use crate::model::{BasicBlock, ResNet, ResidualLayer};
use crate::onnx::proto::{AttributeProto, NodeProto, TensorProto};

/// A value flowing through the traced graph, with its concrete shape for the
/// sample input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedValue {
    pub name: String,
    pub dims: Vec<usize>,
}

/// Modules that can record themselves as ONNX nodes.
pub trait Trace<B: Backend> {
    fn trace(
        &self,
        tracer: &mut GraphTracer,
        prefix: &str,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError>;
}

/// Accumulates nodes and initializers while walking a module tree.
#[derive(Debug, Default)]
pub struct GraphTracer {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    fold_batch_norm: bool,
}

impl GraphTracer {
    pub fn new(fold_batch_norm: bool) -> Self {
        GraphTracer {
            fold_batch_norm,
            ..Default::default()
        }
    }

    pub fn nodes(&self) -> &[NodeProto] {
        &self.nodes
    }

    pub fn into_parts(self) -> (Vec<NodeProto>, Vec<TensorProto>) {
        (self.nodes, self.initializers)
    }

    /// Rename the output of whichever node produced `from`.
    pub fn rename_value(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for name in node.input.iter_mut().chain(node.output.iter_mut()) {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
    }

    fn initializer(&mut self, name: &str, dims: &[usize], values: &[f32]) -> String {
        self.initializers.push(TensorProto::from_f32(name, dims, values));
        name.to_string()
    }

    fn node(
        &mut self,
        prefix: &str,
        op_type: &str,
        inputs: Vec<String>,
        attribute: Vec<AttributeProto>,
        dims: Vec<usize>,
    ) -> TracedValue {
        let path = prefix.replace('.', "/");
        let name = format!("/{path}/{op_type}");
        let output = format!("{name}_output_0");
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute,
            ..Default::default()
        });
        TracedValue { name: output, dims }
    }

    /// Convolution followed by batch norm, folded into one Conv when enabled.
    pub fn conv_bn<B: Backend>(
        &mut self,
        conv_prefix: &str,
        bn_prefix: &str,
        conv: &Conv2d<B>,
        bn: &BatchNorm<B>,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        let weight_name = format!("{conv_prefix}.weight");
        let (weight_dims, mut weight) = tensor_values(&weight_name, conv.weight.val())?;
        let conv_bias = match &conv.bias {
            Some(bias) => Some(tensor_values(&format!("{conv_prefix}.bias"), bias.val())?.1),
            None => None,
        };
        let out_dims = conv_output_dims(&input.dims, &weight_dims, conv)?;
        let attrs = conv_attributes(&weight_dims, conv);

        if self.fold_batch_norm {
            let stats = BatchNormValues::read(bn_prefix, bn)?;
            let bias = stats.fold_into(&mut weight, conv_bias.as_deref());
            let out_channels = weight_dims[0];
            let mut inputs = vec![input.name];
            inputs.push(self.initializer(&weight_name, &weight_dims, &weight));
            inputs.push(self.initializer(&format!("{conv_prefix}.bias"), &[out_channels], &bias));
            return Ok(self.node(conv_prefix, "Conv", inputs, attrs, out_dims));
        }

        let mut inputs = vec![input.name];
        inputs.push(self.initializer(&weight_name, &weight_dims, &weight));
        if let Some(bias) = conv_bias {
            inputs.push(self.initializer(&format!("{conv_prefix}.bias"), &[weight_dims[0]], &bias));
        }
        let conv_out = self.node(conv_prefix, "Conv", inputs, attrs, out_dims);
        self.batch_norm(bn_prefix, bn, conv_out)
    }

    fn batch_norm<B: Backend>(
        &mut self,
        prefix: &str,
        bn: &BatchNorm<B>,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        let stats = BatchNormValues::read(prefix, bn)?;
        let channels = [stats.gamma.len()];
        let inputs = vec![
            input.name,
            self.initializer(&format!("{prefix}.weight"), &channels, &stats.gamma),
            self.initializer(&format!("{prefix}.bias"), &channels, &stats.beta),
            self.initializer(&format!("{prefix}.running_mean"), &channels, &stats.mean),
            self.initializer(&format!("{prefix}.running_var"), &channels, &stats.var),
        ];
        let attrs = vec![
            AttributeProto::float("epsilon", stats.epsilon as f32),
            AttributeProto::float("momentum", 0.9),
        ];
        Ok(self.node(prefix, "BatchNormalization", inputs, attrs, input.dims))
    }

    pub fn relu(&mut self, prefix: &str, input: TracedValue) -> TracedValue {
        self.node(prefix, "Relu", vec![input.name], Vec::new(), input.dims)
    }

    pub fn add(&mut self, prefix: &str, lhs: TracedValue, rhs: TracedValue) -> Result<TracedValue, ExportError> {
        if lhs.dims != rhs.dims {
            return Err(ExportError::Trace(format!(
                "{prefix}: residual shapes differ ({:?} vs {:?})",
                lhs.dims, rhs.dims
            )));
        }
        Ok(self.node(prefix, "Add", vec![lhs.name, rhs.name], Vec::new(), lhs.dims))
    }

    /// 3x3 max pool, stride 2, padding 1.
    pub fn max_pool(&mut self, prefix: &str, input: TracedValue) -> Result<TracedValue, ExportError> {
        let [n, c, h, w] = spatial_dims(prefix, &input.dims)?;
        let pooled = |x: usize| (x + 2 - 3) / 2 + 1;
        let attrs = vec![
            AttributeProto::ints("kernel_shape", &[3, 3]),
            AttributeProto::ints("pads", &[1, 1, 1, 1]),
            AttributeProto::ints("strides", &[2, 2]),
        ];
        let dims = vec![n, c, pooled(h), pooled(w)];
        Ok(self.node(prefix, "MaxPool", vec![input.name], attrs, dims))
    }

    pub fn global_average_pool(&mut self, prefix: &str, input: TracedValue) -> Result<TracedValue, ExportError> {
        let [n, c, _, _] = spatial_dims(prefix, &input.dims)?;
        Ok(self.node(prefix, "GlobalAveragePool", vec![input.name], Vec::new(), vec![n, c, 1, 1]))
    }

    pub fn flatten(&mut self, prefix: &str, input: TracedValue) -> TracedValue {
        let n = input.dims[0];
        let features = input.dims[1..].iter().product();
        let attrs = vec![AttributeProto::int("axis", 1)];
        self.node(prefix, "Flatten", vec![input.name], attrs, vec![n, features])
    }

    /// Fully connected layer as `Gemm(x, W^T, b)` with `W` stored `[out, in]`.
    pub fn gemm<B: Backend>(
        &mut self,
        prefix: &str,
        linear: &burn::nn::Linear<B>,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        let weight_name = format!("{prefix}.weight");
        // burn keeps linear weights as [in, out].
        let (weight_dims, weight) = tensor_values(&weight_name, linear.weight.val().transpose())?;
        let [d_output, d_input] = [weight_dims[0], weight_dims[1]];
        if input.dims.get(1) != Some(&d_input) {
            return Err(ExportError::Trace(format!(
                "{prefix}: expected {d_input} input features, got {:?}",
                input.dims
            )));
        }

        let mut inputs = vec![input.name];
        inputs.push(self.initializer(&weight_name, &weight_dims, &weight));
        if let Some(bias) = &linear.bias {
            let bias_name = format!("{prefix}.bias");
            let (bias_dims, bias) = tensor_values(&bias_name, bias.val())?;
            inputs.push(self.initializer(&bias_name, &bias_dims, &bias));
        }
        let attrs = vec![
            AttributeProto::float("alpha", 1.0),
            AttributeProto::float("beta", 1.0),
            AttributeProto::int("transB", 1),
        ];
        Ok(self.node(prefix, "Gemm", inputs, attrs, vec![input.dims[0], d_output]))
    }
}

impl<B: Backend> Trace<B> for BasicBlock<B> {
    fn trace(
        &self,
        tracer: &mut GraphTracer,
        prefix: &str,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        let identity = match &self.downsample {
            Some(downsample) => tracer.conv_bn(
                &format!("{prefix}.downsample.0"),
                &format!("{prefix}.downsample.1"),
                &downsample.conv,
                &downsample.bn,
                input.clone(),
            )?,
            None => input.clone(),
        };

        let x = tracer.conv_bn(
            &format!("{prefix}.conv1"),
            &format!("{prefix}.bn1"),
            &self.conv1,
            &self.bn1,
            input,
        )?;
        let x = tracer.relu(&format!("{prefix}.relu"), x);
        let x = tracer.conv_bn(
            &format!("{prefix}.conv2"),
            &format!("{prefix}.bn2"),
            &self.conv2,
            &self.bn2,
            x,
        )?;
        let x = tracer.add(&format!("{prefix}.add"), x, identity)?;
        Ok(tracer.relu(&format!("{prefix}.relu_1"), x))
    }
}

impl<B: Backend> Trace<B> for ResidualLayer<B> {
    fn trace(
        &self,
        tracer: &mut GraphTracer,
        prefix: &str,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        self.blocks
            .iter()
            .enumerate()
            .try_fold(input, |x, (i, block)| block.trace(tracer, &format!("{prefix}.{i}"), x))
    }
}

impl<B: Backend> Trace<B> for ResNet<B> {
    fn trace(
        &self,
        tracer: &mut GraphTracer,
        _prefix: &str,
        input: TracedValue,
    ) -> Result<TracedValue, ExportError> {
        let x = tracer.conv_bn("conv1", "bn1", &self.conv1, &self.bn1, input)?;
        let x = tracer.relu("relu", x);
        let mut x = tracer.max_pool("maxpool", x)?;
        for (name, layer) in self.layers() {
            x = layer.trace(tracer, name, x)?;
        }
        let x = tracer.global_average_pool("avgpool", x)?;
        let x = tracer.flatten("flatten", x);
        tracer.gemm("fc", &self.fc, x)
    }
}

struct BatchNormValues {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    mean: Vec<f32>,
    var: Vec<f32>,
    epsilon: f64,
}

impl BatchNormValues {
    fn read<B: Backend>(prefix: &str, bn: &BatchNorm<B>) -> Result<Self, ExportError> {
        Ok(BatchNormValues {
            gamma: tensor_values(&format!("{prefix}.weight"), bn.gamma.val())?.1,
            beta: tensor_values(&format!("{prefix}.bias"), bn.beta.val())?.1,
            mean: tensor_values(&format!("{prefix}.running_mean"), bn.running_mean.value())?.1,
            var: tensor_values(&format!("{prefix}.running_var"), bn.running_var.value())?.1,
            epsilon: bn.epsilon,
        })
    }

    /// Scale `weight` per output channel and return the folded bias.
    ///
    /// `w' = w * γ/√(σ²+ε)`, `b' = β + (b - μ) * γ/√(σ²+ε)`
    fn fold_into(&self, weight: &mut [f32], conv_bias: Option<&[f32]>) -> Vec<f32> {
        let out_channels = self.gamma.len();
        let per_channel = weight.len() / out_channels;
        let mut bias = Vec::with_capacity(out_channels);

        for (o, chunk) in weight.chunks_mut(per_channel).enumerate() {
            let scale = self.gamma[o] as f64 / (self.var[o] as f64 + self.epsilon).sqrt();
            for w in chunk.iter_mut() {
                *w = (*w as f64 * scale) as f32;
            }
            let b = conv_bias.map_or(0.0, |b| b[o] as f64);
            bias.push((self.beta[o] as f64 + (b - self.mean[o] as f64) * scale) as f32);
        }
        bias
    }
}

/// Shape and row-major values of a parameter tensor.
pub fn tensor_values<B: Backend, const D: usize>(
    name: &str,
    tensor: Tensor<B, D>,
) -> Result<(Vec<usize>, Vec<f32>), ExportError> {
    let dims = tensor.dims().to_vec();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ExportError::TensorData {
            name: name.to_string(),
            message: format!("{e:?}"),
        })?;
    Ok((dims, values))
}

fn spatial_dims(prefix: &str, dims: &[usize]) -> Result<[usize; 4], ExportError> {
    <[usize; 4]>::try_from(dims).map_err(|_| {
        ExportError::Trace(format!("{prefix}: expected a 4-d input, got {dims:?}"))
    })
}

/// Height and width padding the convolution was configured with.
fn conv_padding<B: Backend>(weight_dims: &[usize], conv: &Conv2d<B>) -> [usize; 2] {
    match conv.padding.0 {
        PaddingConfig2d::Explicit(ph, pw) => [ph, pw],
        PaddingConfig2d::Valid => [0, 0],
        PaddingConfig2d::Same => {
            let [dh, dw] = conv.dilation;
            [(weight_dims[2] - 1) / 2 * dh, (weight_dims[3] - 1) / 2 * dw]
        }
    }
}

fn conv_attributes<B: Backend>(weight_dims: &[usize], conv: &Conv2d<B>) -> Vec<AttributeProto> {
    let [kh, kw] = [weight_dims[2], weight_dims[3]];
    let [ph, pw] = conv_padding(weight_dims, conv);
    vec![
        AttributeProto::ints("dilations", &conv.dilation),
        AttributeProto::int("group", conv.groups as i64),
        AttributeProto::ints("kernel_shape", &[kh, kw]),
        AttributeProto::ints("pads", &[ph, pw, ph, pw]),
        AttributeProto::ints("strides", &conv.stride),
    ]
}

fn conv_output_dims<B: Backend>(
    input: &[usize],
    weight_dims: &[usize],
    conv: &Conv2d<B>,
) -> Result<Vec<usize>, ExportError> {
    let [n, c, h, w] = spatial_dims("conv", input)?;
    let in_per_group = weight_dims[1] * conv.groups;
    if c != in_per_group {
        return Err(ExportError::Trace(format!(
            "convolution expects {in_per_group} input channels, got {c}"
        )));
    }
    let [ph, pw] = conv_padding(weight_dims, conv);
    let out = |x: usize, p: usize, k: usize, s: usize, d: usize| {
        let span = d * (k - 1) + 1;
        if x + 2 * p < span {
            return Err(ExportError::Trace(format!(
                "convolution kernel spans {span} but the padded input is {}",
                x + 2 * p
            )));
        }
        Ok((x + 2 * p - span) / s + 1)
    };
    Ok(vec![
        n,
        weight_dims[0],
        out(h, ph, weight_dims[2], conv.stride[0], conv.dilation[0])?,
        out(w, pw, weight_dims[3], conv.stride[1], conv.dilation[1])?,
    ])
}

//! End-to-end graph scenarios run through the driver.

mod common;

use std::sync::Arc;

use nnrt_core::compile::NetworkCreator;
use nnrt_core::execution::{ErrorStatus, Request, RequestArgument};
use nnrt_core::memory::HostMemory;
use nnrt_core::model::{ModelBuilder, Operand, OperandType, OperationKind};
use nnrt_core::translate::{per_channel_bias_scales, TranslatorRegistry};

use common::*;

#[test]
fn explicit_padding_nhwc_convolution_keeps_spatial_size() {
    // [1, 5, 5, 3] input, 3x3 filter, padding 1 on every side, stride 1.
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 3]));
    let w = b.operand(Operand::const_f32(&[2, 3, 3, 3], &[1.0; 54]));
    let bias = b.operand(Operand::const_f32(&[2], &[0.5, -1.0]));
    let mut args = vec![x, w, bias];
    for v in [1, 1, 1, 1, 1, 1, 0] {
        args.push(b.operand(Operand::scalar_i32(v)));
    }
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 2]));
    b.operation(OperationKind::Conv2d, &args, &[out]);
    let prepared = local_driver().prepare_model(Arc::new(b.build().unwrap())).unwrap();
    assert_eq!(prepared.compiled().output_desc(0).unwrap().shape, vec![1, 5, 5, 2]);

    let input_len = 75 * 4;
    let memory = HostMemory::new(input_len + 50 * 4);
    memory.write_at(0, &f32_bytes(&[1.0; 75])).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, input_len as u32)],
        vec![RequestArgument::new(0, input_len as u32, 200)],
    )
    .with_pool(Arc::new(memory.clone()));
    let result = prepared.execute_sync(request);
    assert_eq!(result.status, ErrorStatus::None);
    assert_eq!(result.output_shapes[0].dimensions, vec![1, 5, 5, 2]);

    let out = output_f32(&memory, input_len, 50);
    let at = |h: usize, w: usize, c: usize| out[(h * 5 + w) * 2 + c];
    // Corner windows see 2x2 pixels, edges 2x3, the interior 3x3; 3 channels each.
    assert_eq!(at(0, 0, 0), 12.5);
    assert_eq!(at(0, 2, 0), 18.5);
    assert_eq!(at(2, 2, 0), 27.5);
    assert_eq!(at(2, 2, 1), 26.0);
    assert_eq!(at(4, 4, 1), 11.0);
}

#[test]
fn per_channel_depthwise_bias_uses_input_times_filter_scale() {
    let scales = per_channel_bias_scales(0.5, &[0.1, 0.2]);
    assert!((scales[0] - 0.05).abs() < 1e-7);
    assert!((scales[1] - 0.1).abs() < 1e-7);

    // 1x1 depthwise filter, input scale 0.5, filter scales [0.1, 0.2].
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::quantized(OperandType::TensorQuant8Asymm, &[1, 1, 1, 2], 0.5, 0));
    let w = b.operand(Operand::per_channel(&[1, 1, 1, 2], vec![0.1, 0.2], 3).with_value(vec![10, 10]));
    let bias = b.operand(Operand::const_i32(&[2], &[20, 10]));
    let mut args = vec![x, w, bias];
    for v in [0, 0, 0, 0, 1, 1, 1, 0] {
        args.push(b.operand(Operand::scalar_i32(v)));
    }
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 1, 1, 2]));
    b.operation(OperationKind::DepthwiseConv2d, &args, &[out]);
    let prepared = local_driver().prepare_model(Arc::new(b.build().unwrap())).unwrap();

    let memory = HostMemory::new(16);
    // Real input [2.0, 3.0].
    memory.write_at(0, &[4, 6]).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, 2)],
        vec![RequestArgument::new(0, 8, 8)],
    )
    .with_pool(Arc::new(memory.clone()));
    assert_eq!(prepared.execute_sync(request).status, ErrorStatus::None);

    // 2.0 * 1.0 + 20 * 0.05 and 3.0 * 2.0 + 10 * 0.1
    let produced = output_f32(&memory, 8, 2);
    assert!((produced[0] - 3.0).abs() < 1e-5, "{produced:?}");
    assert!((produced[1] - 7.0).abs() < 1e-5, "{produced:?}");
}

#[test]
fn quantize_rounds_half_to_even_and_clamps() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[6]));
    let q = b.output(Operand::quantized(OperandType::TensorQuant8Asymm, &[6], 1.0, 0));
    b.operation(OperationKind::Quantize, &[x], &[q]);
    let prepared = local_driver().prepare_model(Arc::new(b.build().unwrap())).unwrap();

    let memory = HostMemory::new(32);
    memory.write_at(0, &f32_bytes(&[2.5, 3.5, 0.5, -4.0, 300.0, 127.4])).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, 24)],
        vec![RequestArgument::new(0, 24, 6)],
    )
    .with_pool(Arc::new(memory.clone()));
    assert_eq!(prepared.execute_sync(request).status, ErrorStatus::None);
    assert_eq!(memory.read_at(24, 6).unwrap(), vec![2, 4, 0, 0, 255, 127]);
}

/// Dequantize `stored` elements of `width` bytes, then re-encode them into the
/// same encoding through `back` (QUANTIZE, or a RESHAPE with a quantized output).
fn roundtrip(
    operand_type: OperandType,
    zero_point: i32,
    stored: &[u8],
    width: usize,
    back: OperationKind,
) -> Vec<u8> {
    let n = (stored.len() / width) as u32;
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::quantized(operand_type, &[n], 0.25, zero_point));
    let real = b.operand(Operand::tensor(OperandType::TensorFloat32, &[n]));
    let mut args = vec![real];
    if back == OperationKind::Reshape {
        args.push(b.operand(Operand::const_i32(&[1], &[n as i32])));
    }
    let out = b.output(Operand::quantized(operand_type, &[n], 0.25, zero_point));
    b.operation(OperationKind::Dequantize, &[x], &[real]);
    b.operation(back, &args, &[out]);
    let prepared = local_driver().prepare_model(Arc::new(b.build().unwrap())).unwrap();

    let len = stored.len() as u32;
    let memory = HostMemory::new(2 * stored.len());
    memory.write_at(0, stored).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, len)],
        vec![RequestArgument::new(0, len, len)],
    )
    .with_pool(Arc::new(memory.clone()));
    assert_eq!(prepared.execute_sync(request).status, ErrorStatus::None);
    memory.read_at(stored.len(), stored.len()).unwrap()
}

#[test]
fn dequantize_then_quantize_recovers_stored_values() {
    let unsigned = [0u8, 1, 127, 128, 200, 255];
    assert_eq!(
        roundtrip(OperandType::TensorQuant8Asymm, 128, &unsigned, 1, OperationKind::Quantize),
        unsigned
    );

    let signed = [-128i8, -3, 0, 64, 127].map(|v| v as u8);
    assert_eq!(
        roundtrip(OperandType::TensorQuant8AsymmSigned, -3, &signed, 1, OperationKind::Quantize),
        signed
    );
}

#[test]
fn wide_and_symmetric_encodings_survive_requantization() {
    let symm8 = [-128i8, -5, 0, 1, 127].map(|v| v as u8);
    assert_eq!(
        roundtrip(OperandType::TensorQuant8Symm, 0, &symm8, 1, OperationKind::Reshape),
        symm8
    );

    let asymm16: Vec<u8> = [0u16, 1, 999, 1000, 40000, 65535]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    assert_eq!(
        roundtrip(OperandType::TensorQuant16Asymm, 1000, &asymm16, 2, OperationKind::Reshape),
        asymm16
    );

    let symm16: Vec<u8> = [-32768i16, -1, 0, 7, 32767]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    assert_eq!(
        roundtrip(OperandType::TensorQuant16Symm, 0, &symm16, 2, OperationKind::Reshape),
        symm16
    );
}

#[test]
fn building_twice_wires_identically() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 2]));
    let pooled = b.operand(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 2]));
    // Implicit form: scheme, stride w, stride h, filter w, filter h, activation.
    let mut pool_args = vec![x];
    for v in [2, 2, 2, 2, 2, 0] {
        pool_args.push(b.operand(Operand::scalar_i32(v)));
    }
    let shape = b.operand(Operand::const_i32(&[2], &[1, 8]));
    let flat = b.operand(Operand::tensor(OperandType::TensorFloat32, &[1, 8]));
    let beta = b.operand(Operand::scalar_f32(1.0));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 8]));
    b.operation(OperationKind::MaxPool2d, &pool_args, &[pooled]);
    b.operation(OperationKind::Reshape, &[pooled, shape], &[flat]);
    b.operation(OperationKind::Softmax, &[flat, beta], &[out]);
    let model = b.build().unwrap();

    let registry = TranslatorRegistry::standard();
    let first = NetworkCreator::new(&model, &registry).build().unwrap();
    let second = NetworkCreator::new(&model, &registry).build().unwrap();
    assert_eq!(
        first.trace,
        vec![
            (0, OperationKind::MaxPool2d),
            (1, OperationKind::Reshape),
            (2, OperationKind::Softmax)
        ]
    );
    assert_eq!(first.trace, second.trace);
    assert_eq!(first.graph, second.graph);
    assert_eq!(first.graph.results(), second.graph.results());
}

/// Run a one-input, one-output FP32 model and read back `output_len` values.
fn run_f32(model: nnrt_core::model::Model, input: &[f32], output_len: usize) -> Vec<f32> {
    let prepared = local_driver().prepare_model(Arc::new(model)).unwrap();
    let input_len = input.len() * 4;
    let memory = HostMemory::new(input_len + output_len * 4);
    memory.write_at(0, &f32_bytes(input)).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, input_len as u32)],
        vec![RequestArgument::new(0, input_len as u32, (output_len * 4) as u32)],
    )
    .with_pool(Arc::new(memory.clone()));
    assert_eq!(prepared.execute_sync(request).status, ErrorStatus::None);
    output_f32(&memory, input_len, output_len)
}

#[test]
fn transposed_convolution_scatters_each_pixel() {
    // Implicit VALID form, stride 2, 3x3 filter of ones: every input pixel
    // writes its value into a 3x3 block at twice its position.
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 1]));
    let w = b.operand(Operand::const_f32(&[1, 3, 3, 1], &[1.0; 9]));
    let bias = b.operand(Operand::const_f32(&[1], &[0.0]));
    let shape = b.operand(Operand::const_i32(&[4], &[1, 5, 5, 1]));
    let mut args = vec![x, w, bias, shape];
    for v in [2, 2, 2, 0] {
        args.push(b.operand(Operand::scalar_i32(v)));
    }
    args.push(b.operand(Operand::scalar_bool(false)));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 1]));
    b.operation(OperationKind::TransposeConv2d, &args, &[out]);

    let out = run_f32(b.build().unwrap(), &[1.0, 2.0, 3.0, 4.0], 25);
    let at = |h: usize, w: usize| out[h * 5 + w];
    assert_eq!(at(0, 0), 1.0);
    assert_eq!(at(0, 2), 3.0);
    assert_eq!(at(1, 3), 2.0);
    assert_eq!(at(2, 0), 4.0);
    assert_eq!(at(2, 2), 10.0);
    assert_eq!(at(4, 4), 4.0);
}

#[test]
fn space_to_batch_tiles_and_batch_to_space_restores() {
    let input: Vec<f32> = (0..16).map(|v| v as f32).collect();

    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
    let block = b.operand(Operand::const_i32(&[2], &[2, 2]));
    let pads = b.operand(Operand::const_i32(&[2, 2], &[0, 0, 0, 0]));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[4, 2, 2, 1]));
    b.operation(OperationKind::SpaceToBatchNd, &[x, block, pads], &[out]);
    assert_eq!(
        run_f32(b.build().unwrap(), &input, 16),
        vec![0.0, 2.0, 8.0, 10.0, 1.0, 3.0, 9.0, 11.0, 4.0, 6.0, 12.0, 14.0, 5.0, 7.0, 13.0, 15.0]
    );

    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
    let block = b.operand(Operand::const_i32(&[2], &[2, 2]));
    let pads = b.operand(Operand::const_i32(&[2, 2], &[0, 0, 0, 0]));
    let batched = b.operand(Operand::tensor(OperandType::TensorFloat32, &[4, 2, 2, 1]));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
    b.operation(OperationKind::SpaceToBatchNd, &[x, block, pads], &[batched]);
    b.operation(OperationKind::BatchToSpaceNd, &[batched, block], &[out]);
    assert_eq!(run_f32(b.build().unwrap(), &input, 16), input);
}

#[test]
fn bilinear_resize_interpolates_between_pixels() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 1]));
    let width = b.operand(Operand::scalar_i32(4));
    let height = b.operand(Operand::scalar_i32(4));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
    b.operation(OperationKind::ResizeBilinear, &[x, width, height], &[out]);

    assert_eq!(
        run_f32(b.build().unwrap(), &[0.0, 1.0, 2.0, 3.0], 16),
        vec![
            0.0, 0.5, 1.0, 1.0, //
            1.0, 1.5, 2.0, 2.0, //
            2.0, 2.5, 3.0, 3.0, //
            2.0, 2.5, 3.0, 3.0,
        ]
    );
}

#[test]
fn channel_shuffle_interleaves_groups() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 6]));
    let groups = b.operand(Operand::scalar_i32(2));
    let axis = b.operand(Operand::scalar_i32(-1));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 6]));
    b.operation(OperationKind::ChannelShuffle, &[x, groups, axis], &[out]);

    assert_eq!(
        run_f32(b.build().unwrap(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 6),
        vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
    );
}

#[test]
fn local_response_normalization_sums_neighbouring_channels() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 1, 1, 4]));
    let radius = b.operand(Operand::scalar_i32(1));
    let mut args = vec![x, radius];
    for v in [1.0, 1.0, 0.5] {
        args.push(b.operand(Operand::scalar_f32(v)));
    }
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 1, 1, 4]));
    b.operation(OperationKind::LocalResponseNormalization, &args, &[out]);

    let produced = run_f32(b.build().unwrap(), &[1.0, 2.0, 3.0, 4.0], 4);
    // Squared sums over each window: 5, 14, 29, 25.
    let expected = [1.0 / 6f32.sqrt(), 2.0 / 15f32.sqrt(), 3.0 / 30f32.sqrt(), 4.0 / 26f32.sqrt()];
    for (p, e) in produced.iter().zip(expected) {
        assert!((p - e).abs() < 1e-5, "{produced:?}");
    }
}

#[test]
fn top_k_binds_values_and_indices() {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[2, 4]));
    let k = b.operand(Operand::scalar_i32(2));
    let values = b.output(Operand::tensor(OperandType::TensorFloat32, &[2, 2]));
    let indices = b.output(Operand::tensor(OperandType::TensorInt32, &[2, 2]));
    b.operation(OperationKind::TopkV2, &[x, k], &[values, indices]);
    let prepared = local_driver().prepare_model(Arc::new(b.build().unwrap())).unwrap();

    let memory = HostMemory::new(64);
    memory.write_at(0, &f32_bytes(&[1.0, 5.0, 3.0, 5.0, -1.0, -4.0, 0.5, -2.0])).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, 32)],
        vec![RequestArgument::new(0, 32, 16), RequestArgument::new(0, 48, 16)],
    )
    .with_pool(Arc::new(memory.clone()));
    let result = prepared.execute_sync(request);
    assert_eq!(result.status, ErrorStatus::None);
    assert_eq!(result.output_shapes[1].dimensions, vec![2, 2]);

    assert_eq!(output_f32(&memory, 32, 4), vec![5.0, 5.0, 0.5, -1.0]);
    let raw = memory.read_at(48, 16).unwrap();
    let indices: Vec<i32> = raw.chunks(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    assert_eq!(indices, vec![1, 3, 2, 0]);
}

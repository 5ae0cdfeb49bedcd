mod common;

use usmflow_kernels::{builtin_registry, VECTOR_ADD, VECTOR_MUL, VECTOR_SUB};
use usmflow_vulkan::{div_ceil, ConfigError, Error, Pipeline, SequenceState};

const N: u32 = 1024;

fn inputs() -> (Vec<f32>, Vec<f32>) {
    let a = (0..N).map(|i| i as f32).collect();
    let b = (0..N).map(|i| (N - i) as f32 * 0.5).collect();
    (a, b)
}

#[test]
fn test_vector_add_end_to_end() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();
    let (a_host, b_host) = inputs();

    let a = engine.buffer_from_slice(&a_host).unwrap();
    let b = engine.buffer_from_slice(&b_host).unwrap();
    let c = engine.buffer::<f32>(N as usize).unwrap();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline
        .work_group_size(256, 1, 1)
        .unwrap()
        .num_sets(1)
        .unwrap()
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();
    assert!(pipeline.is_built());
    assert!(pipeline.has_push_constants());

    pipeline
        .update_descriptor_set(0, &[a.binding().unwrap(), b.binding().unwrap(), c.binding().unwrap()])
        .unwrap();
    pipeline.update_push_constant_value(&N).unwrap();

    let grid = [div_ceil(N, 256), 1, 1];
    assert_eq!(grid, [4, 1, 1]);
    assert_eq!(pipeline.grid_for([N, 1, 1]), grid);

    let mut seq = engine.make_sequence().unwrap();
    seq.cmd_begin().unwrap();
    pipeline.record_bind_core(seq.handle(), 0).unwrap();
    pipeline.record_bind_push(seq.handle()).unwrap();
    pipeline.record_dispatch(seq.handle(), grid).unwrap();
    seq.insert_host_read_barrier().unwrap();
    seq.cmd_end().unwrap();
    seq.launch_kernel_async().unwrap();
    seq.sync().unwrap();
    assert_eq!(seq.state(), SequenceState::Idle);

    for i in 0..N as usize {
        assert_eq!(c[i], a_host[i] + b_host[i], "mismatch at {i}");
    }
}

#[test]
fn test_bounds_check_leaves_tail_untouched() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();
    let (a_host, b_host) = inputs();

    let a = engine.buffer_from_slice(&a_host).unwrap();
    let b = engine.buffer_from_slice(&b_host).unwrap();
    let c = engine.buffer_filled(N as usize, -1.0f32).unwrap();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_SUB).unwrap();
    pipeline
        .work_group_size(64, 1, 1)
        .unwrap()
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();

    let n = 1000u32;
    pipeline
        .update_descriptor_set(0, &[a.binding().unwrap(), b.binding().unwrap(), c.binding().unwrap()])
        .unwrap();
    pipeline.update_push_constant(&n.to_le_bytes()).unwrap();

    let mut seq = engine.make_sequence().unwrap();
    // grid covers all 1024 elements, push constant limits to 1000
    seq.record(|seq| {
        seq.record_dispatch(&pipeline, 0, pipeline.grid_for([N, 1, 1]))?;
        seq.insert_host_read_barrier()
    })
    .unwrap();
    seq.launch_kernel_async().unwrap();
    seq.sync().unwrap();

    for i in 0..n as usize {
        assert_eq!(c[i], a_host[i] - b_host[i]);
    }
    assert!(c[n as usize..].iter().all(|&x| x == -1.0));
}

#[test]
fn test_record_commands_and_reuse() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let a = engine.buffer_filled(512, 3.0f32).unwrap();
    let b = engine.buffer_filled(512, 4.0f32).unwrap();
    let c = engine.buffer::<f32>(512).unwrap();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_MUL).unwrap();
    pipeline
        .work_group_size(128, 1, 1)
        .unwrap()
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();
    pipeline
        .update_descriptor_set(0, &[a.binding().unwrap(), b.binding().unwrap(), c.binding().unwrap()])
        .unwrap();
    pipeline.update_push_constant_value(&512u32).unwrap();

    let mut seq = engine.make_sequence().unwrap();
    seq.record_commands(&pipeline, 0, pipeline.grid_for([512, 1, 1])).unwrap();
    seq.launch_kernel_async().unwrap();
    seq.sync().unwrap();
    assert!(c.iter().all(|&x| x == 12.0));

    // same sequence, swapped operands
    pipeline
        .update_descriptor_set(0, &[c.binding().unwrap(), b.binding().unwrap(), a.binding().unwrap()])
        .unwrap();
    seq.record_commands(&pipeline, 0, pipeline.grid_for([512, 1, 1])).unwrap();
    seq.launch_kernel_async().unwrap();
    seq.sync().unwrap();
    assert!(a.iter().all(|&x| x == 48.0));
}

#[test]
fn test_build_without_num_buffers() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline.work_group_size(256, 1, 1).unwrap();
    let err = pipeline.build().unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::MissingBufferCount)));
    assert!(!pipeline.is_built());

    // nothing was created, so configuration can continue
    pipeline
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();
    assert!(pipeline.is_built());
}

#[test]
fn test_build_twice_and_zero_workgroup() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline.num_buffers(3).unwrap().push_constant::<u32>().unwrap();
    assert!(matches!(
        pipeline.build(),
        Err(Error::Config(ConfigError::WorkgroupUnset([0, 0, 0])))
    ));

    pipeline.work_group_size(32, 1, 1).unwrap().build().unwrap();
    assert!(matches!(
        pipeline.build(),
        Err(Error::Config(ConfigError::AlreadyBuilt))
    ));
    assert!(matches!(
        pipeline.num_sets(2),
        Err(Error::Config(ConfigError::AlreadyBuilt))
    ));
}

#[test]
fn test_invalid_configuration_values() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let mut pipeline: Pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    assert!(matches!(
        pipeline.num_buffers(0),
        Err(Error::Config(ConfigError::ZeroBufferCount))
    ));
    assert!(matches!(
        pipeline.num_sets(0),
        Err(Error::Config(ConfigError::ZeroSetCount))
    ));
    assert!(matches!(
        pipeline.push_constant_size(129),
        Err(Error::Config(ConfigError::PushConstantTooLarge { requested: 129, .. }))
    ));

    let limits = engine.device().limits();
    pipeline
        .num_buffers(3)
        .unwrap()
        .work_group_size(limits.max_workgroup_size[0].saturating_add(1), 1, 1)
        .unwrap();
    assert!(matches!(
        pipeline.build(),
        Err(Error::Config(ConfigError::WorkgroupTooLarge { .. }))
    ));
}

#[test]
fn test_binding_count_mismatch() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();
    let a = engine.buffer::<f32>(16).unwrap();
    let b = engine.buffer::<f32>(16).unwrap();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline
        .work_group_size(16, 1, 1)
        .unwrap()
        .num_sets(4)
        .unwrap()
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();

    let two = [a.binding().unwrap(), b.binding().unwrap()];
    for set in [0, 3] {
        let err = pipeline.update_descriptor_set(set, &two).unwrap_err();
        assert!(matches!(
            err,
            Error::BindingMismatch { expected: 3, actual: 2, .. }
        ));
    }

    let three = [a.binding().unwrap(), b.binding().unwrap(), a.binding().unwrap()];
    assert!(matches!(
        pipeline.update_descriptor_set(4, &three),
        Err(Error::Index { index: 4, len: 4 })
    ));
    pipeline.update_descriptor_set(3, &three).unwrap();
}

#[test]
fn test_record_bind_core_index() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline
        .work_group_size(16, 1, 1)
        .unwrap()
        .num_sets(2)
        .unwrap()
        .num_buffers(3)
        .unwrap()
        .push_constant::<u32>()
        .unwrap()
        .build()
        .unwrap();

    let mut bare = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    bare.num_buffers(3).unwrap();

    let mut seq = engine.make_sequence().unwrap();
    seq.cmd_begin().unwrap();
    assert!(matches!(
        pipeline.record_bind_core(seq.handle(), 2),
        Err(Error::Index { index: 2, len: 2 })
    ));
    pipeline.record_bind_core(seq.handle(), 1).unwrap();
    pipeline.record_bind_push(seq.handle()).unwrap();
    // no push constants configured
    assert!(matches!(
        bare.record_bind_push(seq.handle()),
        Err(Error::Config(ConfigError::PushConstantsDisabled))
    ));
    seq.cmd_end().unwrap();
}

#[test]
fn test_push_constant_size_mismatch() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline.push_constant::<u32>().unwrap();
    assert!(matches!(
        pipeline.update_push_constant(&[0u8; 8]),
        Err(Error::BindingMismatch { expected: 4, actual: 8, .. })
    ));
    pipeline.update_push_constant_value(&7u32).unwrap();
    assert_eq!(pipeline.push_constant_bytes(), &7u32.to_le_bytes());
}

#[test]
fn test_failed_resize_keeps_previous_layout() {
    let Some(engine) = common::engine() else { return };
    let registry = builtin_registry();
    let x = engine.buffer_filled(64, 1.0f32).unwrap();
    let y = engine.buffer_filled(64, 2.0f32).unwrap();
    let z = engine.buffer::<f32>(64).unwrap();

    let mut pipeline = engine.make_pipeline(&registry, VECTOR_ADD).unwrap();
    pipeline
        .work_group_size(64, 1, 1)
        .unwrap()
        .num_sets(2)
        .unwrap()
        .num_buffers(3)
        .unwrap();

    assert!(matches!(
        pipeline.num_buffers(u32::MAX as usize),
        Err(Error::Config(ConfigError::TooManyDescriptors { sets: 2, .. }))
    ));
    assert!(matches!(
        pipeline.num_sets(usize::MAX),
        Err(Error::Config(ConfigError::TooManyDescriptors { buffers: 3, .. }))
    ));
    assert_eq!(pipeline.config().num_buffers, Some(3));
    assert_eq!(pipeline.set_count(), 2);

    pipeline.push_constant::<u32>().unwrap().build().unwrap();
    pipeline
        .update_descriptor_set(1, &[x.binding().unwrap(), y.binding().unwrap(), z.binding().unwrap()])
        .unwrap();
    pipeline.update_push_constant_value(&64u32).unwrap();

    let mut seq = engine.make_sequence().unwrap();
    seq.record_commands(&pipeline, 1, pipeline.grid_for([64, 1, 1])).unwrap();
    seq.launch_kernel_async().unwrap();
    seq.sync().unwrap();
    assert!(z.iter().all(|&v| v == 3.0));
}

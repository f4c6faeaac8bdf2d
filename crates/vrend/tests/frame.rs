use vrend::decode::{command_header, Opcode};
use vrend::resource::BindFlags;
use vrend::{
    CapsSet, IovecSet, NativeCall, NullBackend, RecordedCall, Renderer, RendererConfig,
    ResourceCreateArgs, TransferBox, TransferDirection, TransferInfo,
};

const B8G8R8A8_UNORM: u32 = 1;
const TEXTURE_2D: u32 = 2;
const OBJECT_SURFACE: u32 = 8;
const CLEAR_COLOR0: u32 = 1 << 2;

fn cmd(opcode: Opcode, object: u32, args: &[u32]) -> Vec<u32> {
    let mut out = vec![command_header(opcode, object, args.len() as u16)];
    out.extend_from_slice(args);
    out
}

fn render_target(handle: u32) -> ResourceCreateArgs {
    ResourceCreateArgs {
        handle,
        target: TEXTURE_2D,
        format: B8G8R8A8_UNORM,
        bind: BindFlags::RENDER_TARGET.bits(),
        width: 4,
        height: 4,
        depth: 1,
        array_size: 1,
        ..ResourceCreateArgs::default()
    }
}

#[test]
fn clear_reaches_the_backend_with_the_bound_surface() {
    let backend = NullBackend::new(1);
    let log = backend.log();
    let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
    renderer.create_context(1, "frame").unwrap();
    renderer.resource_create(&render_target(5)).unwrap();
    renderer.attach_resource(1, 5).unwrap();

    let mut batch = cmd(Opcode::CreateObject, OBJECT_SURFACE, &[20, 5, B8G8R8A8_UNORM, 0, 0]);
    batch.extend(cmd(Opcode::SetFramebufferState, 0, &[1, 0, 20]));
    let red = 1.0f32.to_bits();
    batch.extend(cmd(
        Opcode::Clear,
        0,
        &[CLEAR_COLOR0, red, 0, 0, red, 0, 0, 0],
    ));
    renderer.submit(1, &batch).unwrap();

    let clears: Vec<_> = log
        .executed()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::Clear { targets, color, .. } => Some((targets, color)),
            _ => None,
        })
        .collect();
    assert_eq!(clears.len(), 1);
    let (targets, color) = &clears[0];
    assert_eq!(*color, [1.0, 0.0, 0.0, 1.0]);
    assert!(targets.colors[0].is_some());
    assert!(renderer.context_error(1).is_none());
}

#[test]
fn fences_retire_after_the_backend_signals() {
    let mut renderer =
        Renderer::new(Box::new(NullBackend::new(1)), RendererConfig::default()).unwrap();
    renderer.create_context(1, "fences").unwrap();
    renderer.create_fence(1, 1).unwrap();
    renderer.create_fence(1, 2).unwrap();
    assert_eq!(renderer.pending_fences(), 2);

    assert_eq!(renderer.check_fences(), None);
    assert_eq!(renderer.check_fences(), Some(1));
    assert_eq!(renderer.check_fences(), Some(2));
    assert_eq!(renderer.pending_fences(), 0);
}

#[test]
fn staging_upload_round_trips_through_a_texture() {
    let mut renderer =
        Renderer::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap();
    renderer.create_context(1, "upload").unwrap();
    renderer.resource_create(&render_target(7)).unwrap();
    renderer.attach_resource(1, 7).unwrap();

    let pixels: Vec<u8> = (0..64).collect();
    let info = TransferInfo {
        handle: 7,
        ctx_id: 1,
        area: TransferBox::new([0, 0, 0], [4, 4, 1]),
        ..TransferInfo::default()
    };
    renderer
        .transfer_iov(&info, TransferDirection::ToHost, Some(&IovecSet::single(pixels.clone())))
        .unwrap();

    let readback = IovecSet::single(vec![0u8; 64]);
    renderer
        .transfer_iov(&info, TransferDirection::FromHost, Some(&readback))
        .unwrap();
    let mut out = vec![0u8; 64];
    readback.read_exact(0, &mut out).unwrap();
    assert_eq!(out, pixels);
}

#[test]
fn capability_blob_is_version_two() {
    let renderer = Renderer::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap();
    let caps = renderer.caps();
    assert_eq!(caps.v1.max_version, 2);
    assert_eq!(caps.as_bytes().len(), CapsSet::wire_size());
    assert_eq!(caps.host_feature_check_version, 3);
}

#[test]
fn unknown_sub_command_aborts_the_batch() {
    let mut renderer =
        Renderer::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap();
    renderer.create_context(1, "bad").unwrap();
    let err = renderer.submit(1, &[200]).unwrap_err();
    assert_eq!(err.errno(), vrend::error::EINVAL);
}

#[test]
fn overrunning_sub_command_rejects_the_batch() {
    let backend = NullBackend::new(0);
    let log = backend.log();
    let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
    renderer.create_context(1, "overrun").unwrap();
    renderer.submit(1, &[]).unwrap();
    let before = log.len();

    let batch = [command_header(Opcode::Clear, 0, 8), CLEAR_COLOR0, 0];
    let err = renderer.submit(1, &batch).unwrap_err();
    assert_eq!(err.errno(), vrend::error::EINVAL);
    assert!(log.since(before).is_empty());
}

#[test]
fn state_before_a_rejected_sub_command_stays_applied() {
    let backend = NullBackend::new(0);
    let log = backend.log();
    let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
    renderer.create_context(1, "partial").unwrap();
    renderer.resource_create(&render_target(5)).unwrap();
    renderer.attach_resource(1, 5).unwrap();

    let mut batch = cmd(Opcode::CreateObject, OBJECT_SURFACE, &[20, 5, B8G8R8A8_UNORM, 0, 0]);
    batch.extend(cmd(Opcode::SetFramebufferState, 0, &[1, 0, 20]));
    batch.extend([command_header(Opcode::Clear, 0, 8), CLEAR_COLOR0]);
    let err = renderer.submit(1, &batch).unwrap_err();
    assert_eq!(err.errno(), vrend::error::EINVAL);
    let before = log.len();

    // the framebuffer bound ahead of the bad header is what the next clear hits
    let one = 1.0f32.to_bits();
    renderer
        .submit(1, &cmd(Opcode::Clear, 0, &[CLEAR_COLOR0, 0, one, 0, one, 0, 0, 0]))
        .unwrap();
    let clears: Vec<_> = log
        .since(before)
        .into_iter()
        .filter_map(|call| match call {
            RecordedCall::Execute(NativeCall::Clear { targets, color, .. }) => {
                Some((targets, color))
            }
            _ => None,
        })
        .collect();
    assert_eq!(clears.len(), 1);
    assert!(clears[0].0.colors[0].is_some());
    assert_eq!(clears[0].1, [0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn replayed_batches_give_the_same_outcomes() {
    let one = 1.0f32.to_bits();
    let mut setup = cmd(Opcode::CreateObject, OBJECT_SURFACE, &[20, 5, B8G8R8A8_UNORM, 0, 0]);
    setup.extend(cmd(Opcode::SetFramebufferState, 0, &[1, 0, 20]));
    let mut overrun = cmd(Opcode::Clear, 0, &[CLEAR_COLOR0, one, 0, 0, one, 0, 0, 0]);
    overrun.extend([command_header(Opcode::Clear, 0, 8)]);
    let batches = vec![
        setup.clone(),
        cmd(Opcode::Clear, 0, &[CLEAR_COLOR0, one, one, one, one, 0, 0, 0]),
        vec![200],
        overrun,
        cmd(Opcode::SetFramebufferState, 0, &[1, 0, 99]),
        setup,
        cmd(Opcode::Clear, 0, &[CLEAR_COLOR0, 0, 0, one, one, 0, 0, 0]),
    ];

    let replay = || {
        let backend = NullBackend::new(0);
        let log = backend.log();
        let mut renderer = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
        renderer.create_context(1, "replay").unwrap();
        renderer.resource_create(&render_target(5)).unwrap();
        renderer.attach_resource(1, 5).unwrap();
        let outcomes: Vec<Result<(), i32>> = batches
            .iter()
            .map(|batch| renderer.submit(1, batch).map_err(|err| err.errno()))
            .collect();
        (outcomes, log.len(), renderer.context_error(1).is_some())
    };

    let first = replay();
    assert!(first.0.iter().any(Result::is_ok));
    assert!(first.0.iter().any(Result::is_err));
    assert_eq!(first, replay());
}

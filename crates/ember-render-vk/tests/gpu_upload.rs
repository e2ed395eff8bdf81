// SPDX-License-Identifier: CEPL-1.0
//! Staged transfers, frame slots and teardown against a real device.
//! Skipped where no Vulkan driver exists.
use ash::vk;
use ember_render_vk::frame::FrameController;
use ember_render_vk::mesh::demo_scene;
use ember_render_vk::{
    read_back, release_offscreen, upload_to_device_local, CommandPool, DeviceContext, Mesh,
    MeshData, ShutdownStage, Vertex,
};

fn device() -> Option<(DeviceContext, CommandPool)> {
    let ctx = match DeviceContext::headless(false) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({e})");
            return None;
        }
    };
    let pool = CommandPool::new(&ctx).expect("command pool");
    Some((ctx, pool))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn staged_upload_round_trips_every_size() {
    let Some((ctx, pool)) = device() else { return };

    // Empty, one byte, one alignment unit, and a size spanning several pages.
    for len in [0usize, 1, 256, 3 * 64 * 1024 + 7] {
        let data = pattern(len);
        let buf = upload_to_device_local(
            &ctx,
            &pool,
            &data,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .unwrap_or_else(|e| panic!("upload of {len} bytes: {e}"));
        assert_eq!(buf.size() as usize, len);
        assert_eq!(buf.is_empty(), len == 0);

        let back = read_back(&ctx, &pool, &buf).expect("read back");
        assert_eq!(back, data, "round trip of {len} bytes");
    }
}

#[test]
fn mesh_upload_keeps_vertices_and_indices() {
    let Some((ctx, pool)) = device() else { return };

    let data = MeshData::quad([0.1, 0.9], [-0.5, 0.5], [0.0, 1.0, 0.0]);
    let mesh = Mesh::upload_with_usage(&ctx, &pool, &data, vk::BufferUsageFlags::TRANSFER_SRC)
        .expect("mesh upload");

    let params = mesh.draw_params();
    assert_eq!(params.vertex_count, 4);
    assert_eq!(params.index_count, 6);

    let verts = read_back(&ctx, &pool, mesh.vertex_device_buffer()).unwrap();
    assert_eq!(verts, bytemuck::cast_slice::<Vertex, u8>(&data.vertices));

    let idx = read_back(&ctx, &pool, mesh.index_device_buffer().unwrap()).unwrap();
    assert_eq!(idx, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2, 2, 3, 0]));
}

#[test]
fn non_indexed_mesh_has_no_index_buffer() {
    let Some((ctx, pool)) = device() else { return };

    let data = MeshData {
        vertices: vec![
            Vertex::new([0.0, -0.5, 0.0], [1.0, 0.0, 0.0]),
            Vertex::new([0.5, 0.5, 0.0], [0.0, 1.0, 0.0]),
            Vertex::new([-0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
        ],
        indices: None,
    };
    let mesh = Mesh::upload(&ctx, &pool, &data).expect("mesh upload");
    assert!(mesh.index_buffer().is_none());
    assert_eq!(mesh.draw_params().index_count, 0);
    assert_eq!(mesh.draw_params().vertex_count, 3);
}

#[test]
fn offscreen_frames_cycle_slots_then_release_in_order() {
    let Some((ctx, mut pool)) = device() else { return };

    let meshes = demo_scene()
        .iter()
        .map(|data| Mesh::upload(&ctx, &pool, data))
        .collect::<Result<Vec<_>, _>>()
        .expect("scene upload");
    assert_eq!(meshes.len(), 2);

    // Empty per-image buffers stand in for the recorded draws.
    pool.ensure_per_image(3).expect("command buffers");
    let device = ctx.device();
    for &cmd in pool.per_image() {
        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .unwrap();
            device.end_command_buffer(cmd).unwrap();
        }
    }

    let mut frames = FrameController::new(&ctx, 2, 3).expect("frame slots");
    let slots: Vec<usize> = [0usize, 1, 2]
        .iter()
        .map(|&image| {
            frames
                .submit_offscreen(image, pool.per_image(), ctx.graphics_queue())
                .expect("submit")
        })
        .collect();
    assert_eq!(slots, [0, 1, 0]);
    assert_eq!(frames.current_slot(), 1);

    // Frames are still in flight; release idles the device first.
    let stages = release_offscreen(frames, pool, meshes, ctx);
    assert_eq!(
        stages,
        [
            ShutdownStage::FrameSync,
            ShutdownStage::CommandPool,
            ShutdownStage::Meshes,
            ShutdownStage::Device,
            ShutdownStage::Instance,
        ]
    );
}

#[test]
fn out_of_range_image_is_refused_without_submitting() {
    let Some((ctx, mut pool)) = device() else { return };
    pool.ensure_per_image(2).expect("command buffers");

    let mut frames = FrameController::new(&ctx, 2, 2).expect("frame slots");
    assert!(frames
        .submit_offscreen(5, pool.per_image(), ctx.graphics_queue())
        .is_err());
    // The slot went back to idle, so the same slot is offered again.
    assert_eq!(frames.current_slot(), 0);

    let stages = release_offscreen(frames, pool, Vec::new(), ctx);
    assert_eq!(stages.first(), Some(&ShutdownStage::FrameSync));
}

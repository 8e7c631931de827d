//! Adaptive split example - three simulated devices of different speed

use std::sync::Arc;
use std::time::Duration;
use vdev::kernel::invocation::{load_f32, store_f32};
use vdev::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Adaptive Split Example ===\n");

    // device 0 is the slowest, device 2 four times faster
    let devices: Vec<Arc<dyn Device>> = [4u64, 2, 1]
        .iter()
        .enumerate()
        .map(|(i, &micros)| {
            Arc::new(
                HostDevice::builder(i)
                    .cost_per_item(Duration::from_micros(micros))
                    .build(),
            ) as Arc<dyn Device>
        })
        .collect();

    let config = Config::builder()
        .scheduler(SchedulerKind::FixedPoint)
        .opt_skip(1)
        .comm_aware(false)
        .build()
        .expect("Failed to build config");
    let ctx = Context::new(devices, config).expect("Failed to create context");

    let n = 4096usize;
    let values: Vec<u8> = (0..n).flat_map(|i| (i as f32).to_le_bytes()).collect();
    let buf = ctx
        .create_buffer_from_vec(BufferFlags::NONE, values)
        .expect("Failed to create buffer");

    let analysis = AffineAnalysis::builder()
        .global(
            ArgAccess::ReadWrite,
            Footprint::Linear {
                elem_size: 4,
                per_item: 1,
            },
        )
        .build();
    let body = vdev::kernel::body(|inv| {
        let rows = inv.range().dim0();
        let data = inv.buffer(0)?;
        for i in rows {
            let i = i as usize;
            store_f32(data, i, load_f32(data, i) + 1.0);
        }
        Ok(())
    });
    let kernel = ctx.create_kernel("increment", Arc::new(analysis), body);
    kernel
        .set_arg(0, KernelArg::Buffer(buf.clone()))
        .expect("Failed to bind buffer");

    let range = NdRange::linear(n as u64);
    for launch in 0..12 {
        let start = std::time::Instant::now();
        ctx.enqueue_nd_range_kernel(&kernel, &range)
            .and_then(|event| event.wait())
            .expect("Launch failed");
        let shares = kernel.sched_info().realized_shares();
        println!(
            "launch {:2}: {:>8.2?}  shares {:?}",
            launch,
            start.elapsed(),
            shares.iter().map(|s| format!("{:.3}", s)).collect::<Vec<_>>()
        );
    }

    let mut out = vec![0u8; n * 4];
    ctx.read_buffer(&buf, 0, &mut out).expect("Read failed");
    println!("\nlast element after 12 launches: {}", load_f32(&out, n - 1));

    #[cfg(feature = "telemetry")]
    for m in ctx.metrics() {
        println!(
            "device {}: {} commands, {} bytes in, {} bytes out, utilization {:.1}%",
            m.device,
            m.commands_executed,
            m.bytes_h2d,
            m.bytes_d2h,
            m.utilization() * 100.0
        );
    }
}

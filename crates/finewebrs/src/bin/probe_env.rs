use fineweb_rs::device::{find_cudnn_frontend, find_cudnn_version, probe_gpus, Precision};
use fineweb_rs::observability::init_logging;

fn main() -> anyhow::Result<()> {
    init_logging("warn")?;

    let devices = match probe_gpus() {
        Ok(report) => {
            println!("Driver: {}", report.driver_version);
            println!("CUDA: {}.{}", report.cuda_version.0, report.cuda_version.1);
            for device in &report.devices {
                println!(
                    "GPU {}: {} | {:.1} GiB total, {:.1} GiB free | compute capability {}.{}",
                    device.index,
                    device.name,
                    device.total_memory as f64 / (1u64 << 30) as f64,
                    device.free_memory as f64 / (1u64 << 30) as f64,
                    device.compute_capability.0,
                    device.compute_capability.1
                );
            }
            report.devices
        }
        Err(e) => {
            println!("NVML not available: {}", e);
            Vec::new()
        }
    };

    match find_cudnn_version() {
        Some((major, minor, patch)) => println!("cuDNN: {}.{}.{}", major, minor, patch),
        None => println!("cuDNN: not found"),
    }

    match find_cudnn_frontend() {
        Some(path) => println!("cuDNN frontend path: {}", path.display()),
        None => {
            println!("cuDNN frontend path not found in common locations.");
            println!("You may need to manually specify the path if it's in a different location.");
        }
    }

    println!("The recommended dtype for your hardware is: {}", Precision::recommended(&devices).as_str());
    Ok(())
}

use scan_cuda::{
    encode_segments_by_len, inclusive_segmented_scan_non_negative, scan,
    segmented_scan_and_scatter_non_negative, Device, DeviceArray, Dispatcher, DistributedArray,
    ExecutionStream, HostDevice, Result, ScanConfig, ShardMapping, DEFAULT_STREAM,
};

fn demo<D: Device>(devices: &[D]) -> Result<()> {
    let device = &devices[0];
    let stream = device.stream(DEFAULT_STREAM)?;

    let xs = [1u32, 2, 3, 4, 5];
    let input = device.array_from_slice(&xs)?;
    let mut output = device.zeroed_array(xs.len())?;
    scan(device, stream, &input, &mut output, true)?;
    stream.synchronize()?;
    println!("xs: {:?}", xs);
    println!("inclusive: {:?}", output.to_host()?);
    scan(device, stream, &input, &mut output, false)?;
    stream.synchronize()?;
    println!("exclusive: {:?}", output.to_host()?);

    let encoded = encode_segments_by_len(&[5i32, 3, 2, 1, 4], &[1, 2, 2])?;
    let input = device.array_from_slice(&encoded)?;
    let mut output = device.zeroed_array(encoded.len())?;
    inclusive_segmented_scan_non_negative(device, stream, &input, &mut output)?;
    stream.synchronize()?;
    println!("segments: {:?}", encoded);
    println!("segmented: {:?}", output.to_host()?);

    let indices = device.array_from_slice(&[4u32, 3, 2, 1, 0])?;
    segmented_scan_and_scatter_non_negative(device, stream, &input, &indices, &mut output, true)?;
    stream.synchronize()?;
    println!("scattered: {:?}", output.to_host()?);

    let xs: Vec<u32> = (1..=8).collect();
    let mapping = ShardMapping::stripe(xs.len(), devices.len());
    let dispatcher = Dispatcher::new(devices);
    let input = DistributedArray::from_slice(devices, mapping.clone(), &xs)?;
    let mut output = DistributedArray::zeroed(devices, mapping)?;
    dispatcher.scan(&input, &mut output, true, DEFAULT_STREAM)?;
    dispatcher.synchronize(DEFAULT_STREAM)?;
    println!("sharded {:?}: {:?}", output.mapping().sizes(), output.to_host()?);
    Ok(())
}

fn run(config: &ScanConfig) -> Result<()> {
    println!("host devices");
    demo(&HostDevice::set(2, config)?)?;

    #[cfg(feature = "cuda")]
    {
        let devices = scan_cuda::cuda::CudaDevice::all(config)?;
        if devices.is_empty() {
            log::warn!("no CUDA devices found");
        } else {
            println!("CUDA devices");
            demo(&devices)?;
        }
    }
    Ok(())
}

pub fn main() {
    env_logger::init();
    if let Err(e) = run(&ScanConfig::from_env()) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

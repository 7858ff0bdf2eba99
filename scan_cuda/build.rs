fn main() {
    println!("cargo:rerun-if-changed=../scan_gpu/src");

    #[cfg(feature = "cuda")]
    cuda_builder::CudaBuilder::new("../scan_gpu")
        .copy_to("../resources/scan_gpu.ptx")
        .build()
        .unwrap();
}

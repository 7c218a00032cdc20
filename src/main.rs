use mactrail::cli::main_func;

fn main() -> std::process::ExitCode {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(
            std::thread::available_parallelism()
                .map(|t| t.get())
                .unwrap_or_else(|_e| {
                    eprintln!("WARNING: Unable to read number of available CPUs, defaulting to 4");
                    4
                }),
        )
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(main_func()),
        Err(err) => {
            eprintln!("Failed to build async runtime: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

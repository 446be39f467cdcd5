use anyhow::Result;

#[tokio::main(core_threads = 1)]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    color_backtrace::install();

    enose::acquire().await
}

use dashconv::telemetry;

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    dashconv::run()
}

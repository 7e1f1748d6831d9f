fn main() -> std::process::ExitCode {
    helmsman_cli::run()
}

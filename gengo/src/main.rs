fn main() -> std::process::ExitCode {
    gengo_lib::run()
}

fn main() {
    #[cfg(not(target_os = "linux"))]
    compile_error!("takeover relies on linux socket semantics and only supports linux");
}

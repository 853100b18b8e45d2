fn main() {
    // `SCM_RIGHTS` with `MSG_CMSG_CLOEXEC`, and the `cmsg` layout of the bindings, are linux only.
    #[cfg(not(target_os = "linux"))]
    compile_error!("fd-transfer only supports linux");
}

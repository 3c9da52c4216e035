pub mod sys {
    use std::env;

    const POD_NAME_ENV: &str = "SQL_PROXY_POD_NAME";

    /// Hostname used as the `node_name` metric label. Inside kubernetes the
    /// pod name env var wins over the kernel hostname.
    pub fn hostname() -> String {
        if let Ok(pod_name) = env::var(POD_NAME_ENV) {
            return pod_name;
        }

        #[cfg(target_os = "linux")]
        {
            let mut buf = [0u8; 256];
            let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
            if rc == 0 {
                let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                    return name.to_string();
                }
            }
        }

        "localhost".to_string()
    }

    pub fn num_cpus() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

use std::time::Duration;

/// The machine's own hostname, as the kernel reports it. Agents embed it
/// in their id and the broker compares it against its own to decide
/// whether a pid probe applies.
pub fn local_hostname() -> String {
    let mut buffer = [0_u8; 256];
    // SAFETY: the pointer and length describe a writable buffer we own;
    // gethostname writes a nul-terminated name into it on success.
    let ret = unsafe { libc::gethostname(buffer.as_mut_ptr().cast::<libc::c_char>(), buffer.len()) };
    if ret == 0
        && let Some(len) = buffer.iter().position(|byte| *byte == 0)
        && let Some(bytes) = buffer.get(..len)
        && let Ok(name) = std::str::from_utf8(bytes)
        && !name.is_empty()
    {
        return name.to_owned();
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

pub fn build_agent_id() -> String {
    format!("{}@{}", std::process::id(), local_hostname())
}

pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Probes an OS process without signalling it.
pub fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission/existence checking only; no
    // signal is delivered to the target process.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM still proves the pid exists; we just may not signal it.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_comes_from_the_kernel() -> Result<(), String> {
        let name = local_hostname();
        if name.is_empty() {
            return Err("Hostname is empty".to_owned());
        }
        // The kernel's view is authoritative; an unset $HOSTNAME must not
        // collapse distinct machines onto "localhost".
        if let Ok(kernel) = std::fs::read_to_string("/proc/sys/kernel/hostname")
            && kernel.trim() != name
        {
            return Err(format!(
                "{} does not match the kernel's {}",
                name,
                kernel.trim()
            ));
        }
        Ok(())
    }

    #[test]
    fn agent_ids_embed_pid_and_host() -> Result<(), String> {
        let agent_id = build_agent_id();
        let expected = format!("{}@{}", std::process::id(), local_hostname());
        if agent_id != expected {
            return Err(format!("Unexpected agent id: {}", agent_id));
        }
        Ok(())
    }
}

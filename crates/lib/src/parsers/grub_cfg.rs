//! Line-oriented rewriting of a GRUB configuration.
//!
//! We never regenerate the configuration; the OS image ships one, and we
//! prepend our directives and extend its kernel command lines in place.

/// Directives that introduce a kernel command line in a grub config.
const KERNEL_DIRECTIVES: &[&str] = &["linux", "linuxefi", "linux16"];

/// True when a config line loads a kernel (and therefore carries a
/// command line we may extend).
fn is_kernel_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    KERNEL_DIRECTIVES.iter().any(|directive| {
        trimmed
            .strip_prefix(directive)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace))
    })
}

/// Rewrite a grub configuration: prepend the root-device directive (grub
/// addresses partitions by boot-order position on the first disk) and the
/// console resolution, then optionally append `extra_karg` to every kernel
/// command line.
pub(crate) fn rewrite_config(
    input: &str,
    root_position: u32,
    gfxmode: &str,
    extra_karg: Option<&str>,
) -> String {
    let mut out = String::with_capacity(input.len() + 64);
    out.push_str(&format!("set root=(hd0,{root_position})\n"));
    out.push_str(&format!("set gfxpayload={gfxmode}\n"));
    for line in input.lines() {
        out.push_str(line);
        if let Some(karg) = extra_karg {
            let already_present = line.split_whitespace().any(|w| w == karg);
            if is_kernel_line(line) && !already_present {
                out.push(' ');
                out.push_str(karg);
            }
        }
        out.push('\n');
    }
    out
}

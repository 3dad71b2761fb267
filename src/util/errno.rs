/// Renders a status code the vehicle reports for a rejected request. The vehicle uses the
///  numbers of the POSIX `errno` values.
pub fn error_description(code: u8) -> String {
    let description = match code {
        1 => "EPERM: operation not permitted",
        2 => "ENOENT: no such block or variable",
        7 => "E2BIG: block is too large",
        8 => "ENOEXEC: command format error",
        12 => "ENOMEM: out of memory on the vehicle",
        17 => "EEXIST: block already exists",
        22 => "EINVAL: invalid argument",
        _ => return format!("Unknown error {}", code),
    };
    description.to_string()
}

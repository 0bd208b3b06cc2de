//! The IPv6 DHCP server binary.

fn main() {
    std::process::exit(daemon::run(std::env::args_os()));
}

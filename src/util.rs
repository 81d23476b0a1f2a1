pub const SIZE_W: usize = 8; // bytes per data word

pub fn ceil_div_usize(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

pub fn product(bounds: &[usize]) -> u64 {
    bounds.iter().fold(1u64, |acc, &b| acc * b as u64)
}

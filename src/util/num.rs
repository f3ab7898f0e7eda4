/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

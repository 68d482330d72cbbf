#[cfg(test)]
mod tests {
    use super::super::indicators::*;

    // Helper function to create sample price data
    fn sample_prices() -> Vec<f64> {
        vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ]
    }

    #[test]
    fn test_sma_basic() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&data, 3);

        assert_eq!(result.len(), 3);
        assert!((result[0] - 2.0).abs() < 0.001); // (1+2+3)/3 = 2
        assert!((result[1] - 3.0).abs() < 0.001); // (2+3+4)/3 = 3
        assert!((result[2] - 4.0).abs() < 0.001); // (3+4+5)/3 = 4
    }

    #[test]
    fn test_sma_insufficient_data() {
        let data = vec![1.0, 2.0];
        let result = sma(&data, 5);

        assert_eq!(result.len(), 0);
    }

    #[test]
    fn test_calculate_ema_hand_computed() {
        // seed = mean(1..=5) = 3, α = 1/3: 6 -> 4, 7 -> 5
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let value = calculate_ema(&prices, 5).unwrap();
        assert!((value - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_ema_exact_period_is_sma() {
        let prices = vec![2.0, 4.0, 6.0];
        let value = calculate_ema(&prices, 3).unwrap();
        assert!((value - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_calculate_ema_insufficient_data() {
        assert_eq!(calculate_ema(&[1.0, 2.0, 3.0, 4.0], 5), None);
        assert_eq!(calculate_ema(&[], 5), None);
        assert_eq!(calculate_ema(&[1.0], 0), None);
    }

    #[test]
    fn test_calculate_ema_custom_smoothing() {
        // smoothing 1 over period 3 -> α = 0.25; seed 2, then (6 - 2) * 0.25 + 2 = 3
        let value = calculate_ema_with_smoothing(&[1.0, 2.0, 3.0, 6.0], 3, 1.0).unwrap();
        assert!((value - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_ema_series_starts_with_sma() {
        let data = vec![22.0, 24.0, 23.0, 25.0, 26.0];
        let result = ema(&data, 3);

        assert_eq!(result.len(), 3);
        let first_sma = (22.0 + 24.0 + 23.0) / 3.0;
        assert!((result[0] - first_sma).abs() < 1e-12);
    }

    #[test]
    fn test_ema_increases_with_uptrend() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let result = ema(&data, 3);

        for i in 1..result.len() {
            assert!(result[i] > result[i - 1]);
        }
    }

    #[test]
    fn test_series_length_is_n_minus_p_plus_one() {
        let prices = sample_prices();
        for period in 1..=prices.len() {
            let series = calculate_ema_series(&prices, &[period]);
            assert_eq!(series[&period].values.len(), prices.len() - period + 1);
        }
    }

    #[test]
    fn test_series_latest_matches_calculate_ema() {
        let prices = sample_prices();
        let series = calculate_ema_series(&prices, &[5, 8]);
        for period in [5, 8] {
            let direct = calculate_ema(&prices, period).unwrap();
            assert!((series[&period].latest - direct).abs() < 1e-12);
            assert_eq!(series[&period].values.last().copied(), Some(direct));
        }
    }

    #[test]
    fn test_series_is_all_or_nothing() {
        let prices = sample_prices(); // 20 prices
        let series = calculate_ema_series(&prices, &[5, 8, 22]);
        assert!(series.is_empty());

        let series = calculate_ema_series(&prices[..4], &[5]);
        assert!(series.is_empty());
    }

    #[test]
    fn test_strategy_emas_need_22_bars() {
        let mut closes = vec![100.0; 21];
        assert!(StrategyEmas::from_closes(&closes).is_none());

        closes.push(100.0);
        let emas = StrategyEmas::from_closes(&closes).unwrap();
        assert_eq!(emas.ema22.values.len(), 1);
        assert_eq!(emas.ema8.values.len(), 15);
        assert_eq!(emas.ema5.values.len(), 18);
        assert_eq!(emas.latest(), (100.0, 100.0, 100.0));
    }
}

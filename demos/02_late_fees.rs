/// late fees - accrual after the grace period, payment and waiver
use loan_ledger_rs::{
    InMemoryStore, LateFeeConfig, Ledger, LedgerStore, LoanTerms, Money, PaymentRequest, Rate,
    SafeTimeProvider, TimeSource,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== late fees ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    ));
    let controller = time.test_control().unwrap();
    let ledger = Ledger::with_defaults(InMemoryStore::new());

    // 2% of the installment principal per day after a 3-day grace period, capped at 300
    let late_fee = LateFeeConfig::daily(Rate::from_percentage(2), 3).with_cap(Money::from_major(300));
    let terms = LoanTerms::monthly_simple(
        Money::from_major(10_000),
        Rate::from_percentage(2),
        10,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    )
    .with_late_fee(late_fee);
    let loan = ledger.create_loan(&terms, &time)?;

    // first installment falls due on 2024-02-01; move ten days past it
    controller.advance(Duration::days(41));
    let today = time.now().date_naive();
    println!("today: {}, status: {:?}", today, ledger.refresh_status(loan.id, &time)?);

    let fees = ledger.compute_late_fee_breakdown(loan.id, today)?;
    for item in &fees.items {
        println!(
            "installment {} due {}: {} days overdue, fee {}",
            item.number, item.due_date, item.calculation.days_overdue, item.fee()
        );
    }
    println!("total late fee: {}", fees.total_late_fee);

    // waive part of it, then pay the installment with the rest of the fee
    let waived = ledger.remove_late_fee(loan.id, Money::from_major(40), "first late payment", &time)?;
    println!("waived {}", waived.total());

    let remaining = ledger.compute_late_fee_breakdown(loan.id, today)?.total_late_fee;
    let request = PaymentRequest::new(Money::from_major(1_200))
        .with_late_fee(remaining)
        .with_reference("branch deposit");
    let receipt = ledger.apply_payment(loan.id, &request, &time)?;
    println!(
        "paid {} (late fee {}), status now {:?}",
        receipt.payment.amount,
        receipt.payment.late_fee,
        ledger.store().get_loan(loan.id)?.status
    );

    Ok(())
}
